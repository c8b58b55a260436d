//! Contract between the adapter and the underlying MQTT protocol engine
//!
//! The engine owns the socket and the wire protocol. It is non-blocking and
//! poll driven: the adapter calls [`ProtocolEngine::loop_read`],
//! [`ProtocolEngine::loop_write`] and [`ProtocolEngine::loop_misc`] when the
//! host event loop reports readiness, and the engine reports protocol
//! outcomes back through [`EngineCallbacks`] during those calls.

use crate::error::StatusCode;
use crate::session::{TlsSettings, Will};
use bytes::Bytes;
use rumqttc::QoS;
use std::borrow::Cow;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors reported by a protocol engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("No connection")]
    NoConnection,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("TLS error: {0}")]
    Tls(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Io(_) => StatusCode::Errno,
            EngineError::ConnectionLost(_) => StatusCode::ConnectionLost,
            EngineError::Protocol(_) => StatusCode::Protocol,
            EngineError::NoConnection => StatusCode::NoConnection,
            EngineError::InvalidArgument(_) => StatusCode::Invalid,
            EngineError::Tls(_) => StatusCode::Tls,
        }
    }
}

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Inbound application message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Packet identifier, 0 for QoS 0
    pub mid: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    /// Payload decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Callbacks the engine invokes while processing I/O
///
/// `on_connect` receives the MQTT 3.1.1 CONNACK return code. `on_disconnect`
/// receives 0 for a requested disconnect and otherwise the
/// [`StatusCode`](crate::error::StatusCode) value describing the cause.
pub trait EngineCallbacks {
    fn on_connect(&mut self, code: u8);
    fn on_disconnect(&mut self, code: i32);
    fn on_message(&mut self, message: &Message);
    fn on_log(&mut self, level: LogLevel, text: &str);
    fn on_error(&mut self, reason: &str);

    /// Outbound publish with correlation id `mid` completed
    fn on_publish(&mut self, mid: u16) {
        let _ = mid;
    }

    /// Subscribe request `mid` acknowledged with the granted QoS levels
    fn on_subscribe(&mut self, mid: u16, granted: &[u8]) {
        let _ = (mid, granted);
    }

    /// Unsubscribe request `mid` acknowledged
    fn on_unsubscribe(&mut self, mid: u16) {
        let _ = mid;
    }
}

/// Non-blocking MQTT protocol engine
pub trait ProtocolEngine {
    /// Reset the engine to a fresh client identity, dropping any open socket
    fn reinitialise(&mut self, client_id: &str, clean_session: bool) -> Result<(), EngineError>;

    fn set_credentials(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), EngineError>;

    fn set_tls(&mut self, tls: &TlsSettings) -> Result<(), EngineError>;

    fn set_will(&mut self, will: Option<&Will>) -> Result<(), EngineError>;

    /// Open the socket and queue the CONNECT packet
    fn connect(&mut self, host: &str, port: u16, keepalive_secs: u16) -> Result<(), EngineError>;

    /// Close any open socket and connect again with the parameters of the last `connect`
    fn reconnect(&mut self) -> Result<(), EngineError>;

    /// Send DISCONNECT and close the socket, reporting `on_disconnect` when done
    fn disconnect(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    /// Descriptor of the open socket
    fn socket(&self) -> Option<RawFd>;

    /// Whether outbound data is waiting to be written
    fn want_write(&self) -> bool;

    /// Process readable socket data
    fn loop_read(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    /// Flush pending outbound data
    fn loop_write(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    /// Periodic housekeeping: keepalive pings and timeout detection
    fn loop_misc(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, EngineError>;

    fn unsubscribe(&mut self, filter: &str) -> Result<u16, EngineError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_is_lossy() {
        let message = Message {
            mid: 0,
            topic: "a/b".to_string(),
            payload: Bytes::from_static(b"hi \xff"),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        assert_eq!(message.text(), "hi \u{fffd}");
    }

    #[test]
    fn test_engine_error_codes() {
        assert_eq!(EngineError::NoConnection.status_code(), StatusCode::NoConnection);
        assert_eq!(
            EngineError::Protocol("bad packet".to_string()).status_code(),
            StatusCode::Protocol
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(EngineError::from(io).status_code(), StatusCode::Errno);
    }
}
