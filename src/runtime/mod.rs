//! Host event loop integrations

pub mod tokio_loop;

pub use tokio_loop::{run_until, TokioEventLoop};
