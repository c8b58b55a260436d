//! TOML configuration for the adapter binary
//!
//! A file describes one session: where the broker is, how to authenticate,
//! an optional will, and the subscriptions to make once connected.
//! Credentials are never stored in the file; it names the environment
//! variables that hold them.

use crate::session::{
    qos_from_u8, SessionConfig, TlsSettings, Will, DEFAULT_KEEPALIVE_SECS, DEFAULT_PORT,
    DEFAULT_TLS_PORT,
};
use crate::transport::mqtt::topics::{validate_publish_topic, validate_subscription_filter};
use crate::transport::mqtt::{ClientOptions, DEFAULT_MISC_INTERVAL};
use bytes::Bytes;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Complete adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub tls: TlsSection,
    pub will: Option<WillSection>,
    #[serde(default)]
    pub io: IoSection,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Empty lets the adapter generate an identifier for clean sessions
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// `mqtt://host:port` or `mqtts://host:port`, overrides hostname and port
    pub broker_url: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: default_clean_session(),
            hostname: default_hostname(),
            broker_url: None,
            port: None,
            keepalive_secs: default_keepalive(),
            username_env: None,
            password_env: None,
        }
    }
}

fn default_clean_session() -> bool {
    true
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE_SECS
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoSection {
    /// Housekeeping timer period in milliseconds
    #[serde(default = "default_misc_interval_ms")]
    pub misc_interval_ms: u64,
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            misc_interval_ms: default_misc_interval_ms(),
        }
    }
}

fn default_misc_interval_ms() -> u64 {
    DEFAULT_MISC_INTERVAL.as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    /// Identifier reported with `TopicMatch` events for this filter
    pub id: Option<i32>,
}

impl SubscriptionSection {
    pub fn qos(&self) -> QoS {
        qos_from_u8(self.qos).unwrap_or(QoS::AtMostOnce)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AdapterConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AdapterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.io.misc_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "io.misc_interval_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(will) = &self.will {
            validate_publish_topic(&will.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("will topic '{}': {}", will.topic, e))
            })?;
            check_qos(will.qos, "will")?;
        }

        for subscription in &self.subscriptions {
            validate_subscription_filter(&subscription.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "subscription '{}': {}",
                    subscription.topic, e
                ))
            })?;
            check_qos(subscription.qos, &subscription.topic)?;
        }
        Ok(())
    }

    /// Resolve host, port and whether the URL asks for TLS
    pub fn endpoint(&self) -> Result<(String, u16, bool), ConfigError> {
        let Some(raw) = &self.session.broker_url else {
            let port = self.session.port.unwrap_or(if self.tls.enabled {
                DEFAULT_TLS_PORT
            } else {
                DEFAULT_PORT
            });
            return Ok((self.session.hostname.clone(), port, self.tls.enabled));
        };

        let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
            url: raw.clone(),
            reason: reason.to_string(),
        };
        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(invalid("scheme must be mqtt or mqtts")),
        };
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials belong in username_env / password_env"));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        Ok((host.to_string(), port, tls || self.tls.enabled))
    }

    /// Build the session parameters, reading credentials from the environment
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;
        let (hostname, port, tls_enabled) = self.endpoint()?;

        let will = self.will.as_ref().map(|will| Will {
            topic: will.topic.clone(),
            payload: Bytes::from(will.payload.clone().into_bytes()),
            qos: qos_from_u8(will.qos).unwrap_or(QoS::AtMostOnce),
            retain: will.retain,
        });

        Ok(SessionConfig {
            client_id: self.session.client_id.clone(),
            clean_session: self.session.clean_session,
            hostname,
            port,
            keepalive_secs: self.session.keepalive_secs,
            username: get_env_var(self.session.username_env.as_deref())?,
            password: get_env_var(self.session.password_env.as_deref())?,
            tls: TlsSettings {
                enabled: tls_enabled,
                insecure: self.tls.insecure,
                ca_file: self.tls.ca_file.clone(),
                ca_path: self.tls.ca_path.clone(),
                cert_file: self.tls.cert_file.clone(),
                key_file: self.tls.key_file.clone(),
            },
            will,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            misc_interval: Duration::from_millis(self.io.misc_interval_ms),
        }
    }

    /// Render the configuration for display.
    ///
    /// The file only names credential variables; whether they are set is
    /// appended without their values.
    pub fn to_display_string(&self) -> Result<String, ConfigError> {
        let mut rendered = toml::to_string_pretty(self)?;
        for (label, var) in [
            ("username", &self.session.username_env),
            ("password", &self.session.password_env),
        ] {
            if let Some(var) = var {
                let status = if std::env::var(var).is_ok() {
                    "***"
                } else {
                    "<unset>"
                };
                rendered.push_str(&format!("# {label} (${var}) = {status}\n"));
            }
        }
        Ok(rendered)
    }
}

fn check_qos(qos: u8, what: &str) -> Result<(), ConfigError> {
    if qos_from_u8(qos).is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "{what}: QoS must be 0, 1 or 2, got {qos}"
        )));
    }
    Ok(())
}

/// Read a named variable; an unnamed one resolves to empty
fn get_env_var(name: Option<&str>) -> Result<String, ConfigError> {
    match name {
        Some(name) => {
            std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
        }
        None => Ok(String::new()),
    }
}
