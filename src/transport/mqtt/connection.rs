//! Pure connection state management for the MQTT session
//!
//! This module holds the state transition rules, connect parameter
//! validation and the caller-side reconnection backoff. Nothing here touches
//! the engine or the event loop.

use crate::error::{AdapterError, AdapterResult};
use crate::session::SessionConfig;
use std::fmt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Keepalive intervals below this (other than 0) are rejected
pub const MIN_KEEPALIVE_SECS: u16 = 5;

/// Longest client identifier the CONNECT packet can carry
pub const MAX_CLIENT_ID_LEN: usize = 65_535;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket, no pending connect
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK accepted, ready for operations
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Engine accepted a connect or reconnect request
    ConnectStarted,
    /// CONNACK with return code 0
    ConnAckAccepted,
    /// CONNACK with a non-zero return code
    ConnAckRefused(u8),
    /// Session closed, requested or by the peer
    Closed(i32),
    /// Fatal read, write or housekeeping error
    TransportFailed(String),
}

/// Next state for `event`, or `None` when the event does not apply to `current`.
///
/// A CONNACK only counts while connecting, so a disconnect issued before the
/// CONNACK arrived is never undone by it.
pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (current, event) {
        (Disconnected, ConnectionEvent::ConnectStarted) => Some(Connecting),
        (Connecting, ConnectionEvent::ConnAckAccepted) => Some(Connected),
        (Connecting, ConnectionEvent::ConnAckRefused(_)) => Some(Disconnected),
        (Connecting | Connected, ConnectionEvent::Closed(_)) => Some(Disconnected),
        (Connecting | Connected, ConnectionEvent::TransportFailed(_)) => Some(Disconnected),
        _ => None,
    }
}

/// Whether requests may be handed to the engine in `state`
pub fn can_publish(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

/// Log a state transition at a level matching its significance
pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
    match (from, to, event) {
        (ConnectionState::Connecting, ConnectionState::Connected, _) => {
            info!("MQTT connection established");
        }
        (_, ConnectionState::Disconnected, ConnectionEvent::ConnAckRefused(code)) => {
            warn!(code, "MQTT broker refused connection: {}", connack_reason(*code));
        }
        (_, ConnectionState::Disconnected, ConnectionEvent::TransportFailed(reason)) => {
            error!("MQTT connection lost: {}", reason);
        }
        (ConnectionState::Connected, ConnectionState::Disconnected, ConnectionEvent::Closed(code)) => {
            info!(code, "MQTT connection closed");
        }
        _ => {
            debug!("MQTT connection state: {} -> {}", from, to);
        }
    }
}

/// Human readable meaning of an MQTT 3.1.1 CONNACK return code
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

/// Validated parameters for a single connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub clean_session: bool,
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u16,
}

/// Check the session settings and derive the connect parameters.
///
/// An empty client id is replaced by a generated one when the session is
/// clean. A persistent session needs a stable identity, so an empty id is
/// rejected there.
pub fn prepare_connect(config: &SessionConfig) -> AdapterResult<ConnectParams> {
    if config.hostname.trim().is_empty() {
        return Err(AdapterError::invalid_config("hostname must not be empty"));
    }
    if config.port == 0 {
        return Err(AdapterError::invalid_config("port must not be 0"));
    }
    if config.keepalive_secs != 0 && config.keepalive_secs < MIN_KEEPALIVE_SECS {
        return Err(AdapterError::invalid_config(format!(
            "keepalive must be 0 or at least {MIN_KEEPALIVE_SECS} seconds, got {}",
            config.keepalive_secs
        )));
    }
    if config.password().is_some() && config.username().is_none() {
        return Err(AdapterError::invalid_config(
            "password requires a username",
        ));
    }
    if config.tls.cert_file.is_some() != config.tls.key_file.is_some() {
        return Err(AdapterError::invalid_config(
            "TLS certificate and key must be configured together",
        ));
    }
    if config.client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(AdapterError::invalid_config(format!(
            "client id exceeds {MAX_CLIENT_ID_LEN} bytes"
        )));
    }

    let client_id = if config.client_id.is_empty() {
        if !config.clean_session {
            return Err(AdapterError::invalid_config(
                "a persistent session requires a client id",
            ));
        }
        generate_client_id()
    } else {
        config.client_id.clone()
    };

    Ok(ConnectParams {
        client_id,
        clean_session: config.clean_session,
        host: config.hostname.clone(),
        port: config.port,
        keepalive_secs: config.keepalive_secs,
    })
}

/// Random client identifier for clean sessions without a configured id
pub fn generate_client_id() -> String {
    format!("mqtt-adapter-{}", Uuid::new_v4().simple())
}

/// Backoff schedule for callers that reconnect after a lost session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![500, 1000, 2000, 5000],
            sustained_delay: 10_000,
        }
    }
}

/// Outcome of [`ReconnectPolicy::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Decide whether to try again after `attempts_so_far` failed attempts
    pub fn decide(&self, attempts_so_far: u32, shutdown_requested: bool) -> ReconnectDecision {
        if shutdown_requested {
            return ReconnectDecision::AbortShutdownRequested;
        }
        if let Some(max_attempts) = self.max_attempts {
            if attempts_so_far >= max_attempts {
                return ReconnectDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_so_far + 1;
        ReconnectDecision::Proceed {
            attempt,
            delay_ms: self.calculate_backoff_delay(attempt),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TlsSettings;
    use std::path::PathBuf;

    #[test]
    fn test_connect_only_from_disconnected() {
        let event = ConnectionEvent::ConnectStarted;
        assert_eq!(
            next_state(ConnectionState::Disconnected, &event),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(next_state(ConnectionState::Connecting, &event), None);
        assert_eq!(next_state(ConnectionState::Connected, &event), None);
    }

    #[test]
    fn test_connack_only_counts_while_connecting() {
        let accepted = ConnectionEvent::ConnAckAccepted;
        assert_eq!(
            next_state(ConnectionState::Connecting, &accepted),
            Some(ConnectionState::Connected)
        );
        assert_eq!(next_state(ConnectionState::Disconnected, &accepted), None);
        assert_eq!(next_state(ConnectionState::Connected, &accepted), None);

        let refused = ConnectionEvent::ConnAckRefused(5);
        assert_eq!(
            next_state(ConnectionState::Connecting, &refused),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(next_state(ConnectionState::Disconnected, &refused), None);
    }

    #[test]
    fn test_close_is_ignored_when_disconnected() {
        let closed = ConnectionEvent::Closed(0);
        assert_eq!(next_state(ConnectionState::Disconnected, &closed), None);
        assert_eq!(
            next_state(ConnectionState::Connected, &closed),
            Some(ConnectionState::Disconnected)
        );

        let failed = ConnectionEvent::TransportFailed("reset".to_string());
        assert_eq!(
            next_state(ConnectionState::Connecting, &failed),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(next_state(ConnectionState::Disconnected, &failed), None);
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(can_publish(ConnectionState::Connected));
        assert!(!can_publish(ConnectionState::Connecting));
        assert!(!can_publish(ConnectionState::Disconnected));
    }

    #[test]
    fn test_prepare_connect_defaults() {
        let params = prepare_connect(&SessionConfig::default()).unwrap();
        assert!(params.client_id.starts_with("mqtt-adapter-"));
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 1883);
        assert_eq!(params.keepalive_secs, 60);
        assert!(params.clean_session);
    }

    #[test]
    fn test_prepare_connect_keeps_configured_id() {
        let config = SessionConfig {
            client_id: "sensor-1".to_string(),
            clean_session: false,
            ..SessionConfig::default()
        };
        let params = prepare_connect(&config).unwrap();
        assert_eq!(params.client_id, "sensor-1");
        assert!(!params.clean_session);
    }

    #[test]
    fn test_prepare_connect_rejects_bad_settings() {
        let cases = vec![
            SessionConfig {
                hostname: " ".to_string(),
                ..SessionConfig::default()
            },
            SessionConfig {
                port: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                keepalive_secs: 3,
                ..SessionConfig::default()
            },
            SessionConfig {
                password: "secret".to_string(),
                ..SessionConfig::default()
            },
            SessionConfig {
                clean_session: false,
                ..SessionConfig::default()
            },
            SessionConfig {
                tls: TlsSettings {
                    cert_file: Some(PathBuf::from("client.pem")),
                    ..TlsSettings::default()
                },
                ..SessionConfig::default()
            },
        ];

        for config in cases {
            let result = prepare_connect(&config);
            assert!(
                matches!(result, Err(AdapterError::InvalidConfig(_))),
                "expected rejection for {config:?}"
            );
        }
    }

    #[test]
    fn test_keepalive_zero_is_allowed() {
        let config = SessionConfig {
            keepalive_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(prepare_connect(&config).unwrap().keepalive_secs, 0);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_client_id(), generate_client_id());
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.backoff_pattern, vec![500, 1000, 2000, 5000]);
        assert_eq!(policy.sustained_delay, 10_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.calculate_backoff_delay(1), 500);
        assert_eq!(policy.calculate_backoff_delay(4), 5000);
        assert_eq!(policy.calculate_backoff_delay(5), 10_000);
        assert_eq!(policy.calculate_backoff_delay(100), 10_000);
    }

    #[test]
    fn test_reconnect_decisions() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::default()
        };

        assert_eq!(
            policy.decide(0, false),
            ReconnectDecision::Proceed {
                attempt: 1,
                delay_ms: 500
            }
        );
        assert_eq!(policy.decide(2, false), ReconnectDecision::AbortMaxAttemptsExceeded);
        assert_eq!(policy.decide(0, true), ReconnectDecision::AbortShutdownRequested);
    }

    #[test]
    fn test_policy_validation() {
        let policy = ReconnectPolicy {
            max_attempts: Some(0),
            ..ReconnectPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = ReconnectPolicy {
            sustained_delay: 0,
            ..ReconnectPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_connack_reasons() {
        assert_eq!(connack_reason(0), "connection accepted");
        assert_eq!(connack_reason(5), "not authorized");
        assert_eq!(connack_reason(42), "unknown return code");
    }
}
