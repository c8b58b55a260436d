//! Observability for the adapter: structured logging through `tracing`
//!
//! The library only emits events; installing a subscriber is left to the
//! binary, which uses [`init_default_logging`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};
