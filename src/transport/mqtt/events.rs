//! Events emitted by the MQTT session

use super::connection::connack_reason;
use super::engine::{LogLevel, Message};
use crate::error::StatusCode;
use std::fmt;

/// Asynchronous session failure reported through [`ClientEvent::Error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Broker answered CONNECT with a non-zero return code
    Refused { code: u8 },
    /// Fatal socket or protocol failure while processing I/O
    Transport { reason: String },
    /// Error reported by the engine without a state change
    Engine { reason: String },
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::Refused { code: 4 | 5 } => StatusCode::Auth,
            SessionError::Refused { .. } => StatusCode::ConnectionRefused,
            SessionError::Transport { .. } => StatusCode::ConnectionLost,
            SessionError::Engine { .. } => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Refused { code } => {
                write!(f, "connection refused ({code}): {}", connack_reason(*code))
            }
            SessionError::Transport { reason } => write!(f, "transport failure: {reason}"),
            SessionError::Engine { reason } => write!(f, "engine error: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Everything the session reports to the host application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connect or reconnect started
    Connecting,
    /// Broker accepted the connection
    Connected,
    /// Session closed. `code` is 0 after a requested disconnect.
    Disconnected { code: i32 },
    /// The connected flag flipped
    ConnectedChanged(bool),
    /// Inbound message, with the identifier registered for its topic
    Message { message: Message, id: Option<i32> },
    /// Inbound message on a registered topic
    TopicMatch { topic: String, id: i32 },
    Error(SessionError),
    Log { level: LogLevel, message: String },
    /// Outbound publish completed
    Published { mid: u16, topic: Option<String> },
    Subscribed {
        mid: u16,
        topic: Option<String>,
        granted: Vec<u8>,
    },
    Unsubscribed { mid: u16, topic: Option<String> },
}

impl ClientEvent {
    /// Short name, used for structured logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Connecting => "connecting",
            ClientEvent::Connected => "connected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::ConnectedChanged(_) => "connected_changed",
            ClientEvent::Message { .. } => "message",
            ClientEvent::TopicMatch { .. } => "topic_match",
            ClientEvent::Error(_) => "error",
            ClientEvent::Log { .. } => "log",
            ClientEvent::Published { .. } => "published",
            ClientEvent::Subscribed { .. } => "subscribed",
            ClientEvent::Unsubscribed { .. } => "unsubscribed",
        }
    }
}
