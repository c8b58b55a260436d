//! Error types and integer status codes for the MQTT adapter
//!
//! Every fallible caller-facing operation returns [`AdapterError`]. Hosts that
//! prefer plain integer status codes (the style of the C protocol libraries
//! this adapter usually fronts) can map any error with
//! [`AdapterError::status_code`]; success is always [`StatusCode::Success`].

use crate::transport::mqtt::connection::ConnectionState;
use crate::transport::mqtt::engine::EngineError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Integer status codes, numbered like the mosquitto client library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    ConnectPending = -1,
    Success = 0,
    NoMemory = 1,
    Protocol = 2,
    Invalid = 3,
    NoConnection = 4,
    ConnectionRefused = 5,
    NotFound = 6,
    ConnectionLost = 7,
    Tls = 8,
    PayloadSize = 9,
    NotSupported = 10,
    Auth = 11,
    AclDenied = 12,
    Unknown = 13,
    Errno = 14,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Payload of {0} bytes exceeds the MQTT limit")]
    PayloadTooLarge(usize),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Connection already in progress - current state: {state:?}")]
    AlreadyConnected { state: ConnectionState },

    #[error("Protocol engine error: {0}")]
    Engine(#[from] EngineError),
}

impl AdapterError {
    /// Map the error onto its integer status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdapterError::InvalidConfig(_)
            | AdapterError::InvalidTopic { .. } => StatusCode::Invalid,
            AdapterError::PayloadTooLarge(_) => StatusCode::PayloadSize,
            AdapterError::NotConnected { .. } => StatusCode::NoConnection,
            AdapterError::AlreadyConnected { .. } => StatusCode::ConnectPending,
            AdapterError::Engine(e) => e.status_code(),
        }
    }

    /// Create invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create invalid topic error
    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// Status code of an operation result, `Success` for `Ok`
pub fn status_of<T>(result: &AdapterResult<T>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Success,
        Err(e) => e.status_code(),
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid regex")
});

static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(mqtts?|tcp|ssl)://[^/@\s:]+:[^/@\s]+@").expect("valid regex"));

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials from free text before it reaches logs or events
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = URL_CREDENTIALS
        .replace_all(&sanitized, "${1}://***@")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Success.as_i32(), 0);
        assert_eq!(StatusCode::Invalid.as_i32(), 3);
        assert_eq!(StatusCode::NoConnection.as_i32(), 4);
        assert_eq!(StatusCode::ConnectPending.as_i32(), -1);
        assert!(StatusCode::Success.is_success());
        assert!(!StatusCode::ConnectionLost.is_success());
    }

    #[test]
    fn test_every_error_maps_to_non_zero_code() {
        let errors = vec![
            AdapterError::invalid_config("empty hostname"),
            AdapterError::invalid_topic("a/#/b", "wildcard"),
            AdapterError::PayloadTooLarge(300_000_000),
            AdapterError::NotConnected {
                state: ConnectionState::Disconnected,
            },
            AdapterError::AlreadyConnected {
                state: ConnectionState::Connecting,
            },
            AdapterError::Engine(EngineError::ConnectionLost("reset".to_string())),
        ];

        for error in errors {
            assert_ne!(error.status_code(), StatusCode::Success, "{error}");
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_status_of_result() {
        let ok: AdapterResult<u16> = Ok(7);
        assert_eq!(status_of(&ok), StatusCode::Success);

        let err: AdapterResult<u16> = Err(AdapterError::NotConnected {
            state: ConnectionState::Disconnected,
        });
        assert_eq!(status_of(&err), StatusCode::NoConnection);
    }

    #[test]
    fn test_engine_error_code_passthrough() {
        let error: AdapterError = EngineError::Tls("handshake failed".to_string()).into();
        assert_eq!(error.status_code(), StatusCode::Tls);
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("auth failed: password=hunter2 token: abc");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_redacts_url_credentials() {
        let sanitized = sanitize_error_message("cannot reach mqtt://user:pw@broker.local:1883");
        assert!(!sanitized.contains("user:pw"));
        assert!(sanitized.contains("mqtt://***@broker.local:1883"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"y".repeat(500));
        assert_eq!(exact.len(), 500);
    }

    #[test]
    fn test_sanitize_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
