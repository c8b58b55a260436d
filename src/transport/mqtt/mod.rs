//! Event-driven MQTT session
//!
//! The session is split into focused sub-modules, keeping the pure rules
//! apart from the code that touches the engine or the event loop:
//!
//! - [`connection`] - Pure connection state rules, connect validation and reconnect backoff
//! - [`topics`] - Topic name and filter validation
//! - [`registry`] - Topic to identifier routing table
//! - [`engine`] - Contract with the non-blocking protocol engine
//! - [`event_loop`] - Contract with the host event loop
//! - [`bridge`] - Socket notifier bookkeeping
//! - [`message_handler`] - Engine callback dispatch
//! - [`client`] - Caller-facing operations and coordination
//! - [`tcp_engine`] - MQTT 3.1.1 engine over a TCP socket
//! - [`tls`] - rustls client configuration for the TCP engine
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_adapter::runtime::TokioEventLoop;
//! use mqtt_adapter::session::SessionConfig;
//! use mqtt_adapter::transport::mqtt::{ClientEvent, MqttClient, TcpEngine};
//! use rumqttc::QoS;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig {
//!     hostname: "broker.local".to_string(),
//!     ..SessionConfig::default()
//! };
//! let mut client = MqttClient::new(TcpEngine::new(), TokioEventLoop::new(), config);
//! let mut events = client.event_channel();
//! client.connect_to_host()?;
//!
//! loop {
//!     let event = client.event_loop_mut().next_event().await;
//!     client.handle_event(event);
//!     while let Ok(event) = events.try_recv() {
//!         if event == ClientEvent::Connected {
//!             client.subscribe_with_id("sensors/#", QoS::AtLeastOnce, 1)?;
//!         }
//!     }
//! }
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod connection;
pub mod engine;
pub mod event_loop;
pub mod events;
pub mod message_handler;
pub mod registry;
pub mod tcp_engine;
pub mod tls;
pub mod topics;

// Re-export public types for convenience
pub use bridge::{IoBridge, Notifier, NotifierHandles, DEFAULT_MISC_INTERVAL};
pub use client::{ClientOptions, MqttClient};
pub use connection::{
    ConnectParams, ConnectionEvent, ConnectionState, ReconnectDecision, ReconnectPolicy,
};
pub use engine::{EngineCallbacks, EngineError, LogLevel, Message, ProtocolEngine};
pub use event_loop::{EventLoop, LoopEvent, WatchId};
pub use events::{ClientEvent, SessionError};
pub use message_handler::{PendingRequest, PendingRequests, RequestKind, SessionCore};
pub use registry::TopicRegistry;
pub use tcp_engine::TcpEngine;
pub use topics::TopicError;
