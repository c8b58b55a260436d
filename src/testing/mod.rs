//! Testing utilities and fake implementations
//!
//! This module provides a fake protocol engine and a fake host event loop so
//! the session can be exercised without a broker or a reactor.

pub mod mocks;

pub use mocks::*;
