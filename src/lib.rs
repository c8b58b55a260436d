//! Event-driven MQTT client adapter
//!
//! Manages a single MQTT session over TCP and drives it from a host event
//! loop instead of a dedicated network thread. The protocol engine is
//! non-blocking; the adapter watches its socket, runs the engine when the
//! socket is readable or writable or the housekeeping timer fires, and turns
//! engine callbacks into [`ClientEvent`]s.
//!
//! - [`session`] - Connection parameters and their change notifications
//! - [`transport::mqtt`] - State machine, I/O bridge, dispatcher and client
//! - [`runtime`] - [`EventLoop`](transport::mqtt::EventLoop) on the tokio reactor
//! - [`config`] - TOML configuration used by the binary
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_adapter::runtime::{run_until, TokioEventLoop};
//! use mqtt_adapter::session::SessionConfig;
//! use mqtt_adapter::{ClientEvent, MqttClient, TcpEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = MqttClient::new(TcpEngine::new(), TokioEventLoop::new(), SessionConfig::default());
//! client.on_event(|event| {
//!     if let ClientEvent::Message { message, .. } = event {
//!         println!("{} {:?}", message.topic, message.text());
//!     }
//! });
//! client.connect_to_host()?;
//! run_until(&mut client, tokio::signal::ctrl_c()).await?;
//! client.disconnect_from_host()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{AdapterConfig, ConfigError};
pub use error::{AdapterError, AdapterResult, StatusCode};
pub use session::{SessionConfig, SessionSettings};
pub use transport::mqtt::{ClientEvent, ConnectionState, MqttClient, TcpEngine};
