//! Session parameters and their observable settings
//!
//! [`SessionConfig`] is the plain data used to configure the protocol engine
//! at connect time. [`SessionSettings`] wraps it with change notifications
//! and the rule that the client identity is frozen while connected.

pub mod notify;
pub mod settings;

pub use notify::{ListenerId, Listeners};
pub use settings::{SessionSettings, SettingChange};

use bytes::Bytes;
use rumqttc::QoS;
use std::path::PathBuf;

/// Broker port used when none is configured
pub const DEFAULT_PORT: u16 = 1883;
/// Broker port used for `mqtts://` URLs
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Keepalive interval in seconds used when none is configured
pub const DEFAULT_KEEPALIVE_SECS: u16 = 60;

/// Connection parameters applied at the next connect
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub client_id: String,
    pub clean_session: bool,
    pub hostname: String,
    pub port: u16,
    pub keepalive_secs: u16,
    /// Empty means no username is sent
    pub username: String,
    /// Empty means no password is sent
    pub password: String,
    pub tls: TlsSettings,
    pub will: Option<Will>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            hostname: "localhost".to_string(),
            port: DEFAULT_PORT,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            username: String::new(),
            password: String::new(),
            tls: TlsSettings::default(),
            will: None,
        }
    }
}

impl SessionConfig {
    /// Username to hand to the engine, `None` when unset
    pub fn username(&self) -> Option<&str> {
        (!self.username.is_empty()).then_some(self.username.as_str())
    }

    /// Password to hand to the engine, `None` when unset
    pub fn password(&self) -> Option<&str> {
        (!self.password.is_empty()).then_some(self.password.as_str())
    }
}

/// TLS parameters passed through to the protocol engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Skip server hostname verification
    pub insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Message the broker publishes on the client's behalf after an unclean disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Convert a numeric QoS level
pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Numeric value of a QoS level
pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
