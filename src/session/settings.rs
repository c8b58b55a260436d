//! Observable session settings
//!
//! Each setter is a no-op when the value does not change. Otherwise it stores
//! the value and notifies every listener once with the new value. Setters
//! never perform network I/O; values are picked up at the next connect.

use super::notify::{ListenerId, Listeners};
use super::{SessionConfig, TlsSettings, Will};
use crate::error::AdapterResult;
use crate::transport::mqtt::topics::validate_publish_topic;
use bytes::Bytes;
use rumqttc::QoS;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Notification carrying the new value of a single setting
#[derive(Debug, Clone, PartialEq)]
pub enum SettingChange {
    ClientId(String),
    CleanSession(bool),
    Hostname(String),
    Port(u16),
    Keepalive(u16),
    Username(String),
    Password(String),
    TlsEnabled(bool),
    TlsInsecure(bool),
    TlsCaFile(Option<PathBuf>),
    TlsCaPath(Option<PathBuf>),
    TlsCertFile(Option<PathBuf>),
    TlsKeyFile(Option<PathBuf>),
    Will(Option<Will>),
}

/// Store `value` into `slot`, returning whether it changed
fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Session configuration with per-field change notification
#[derive(Debug, Default)]
pub struct SessionSettings {
    config: SessionConfig,
    listeners: Listeners<SettingChange>,
    identity_locked: bool,
}

impl SessionSettings {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            listeners: Listeners::new(),
            identity_locked: false,
        }
    }

    /// Register a change listener
    pub fn on_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&SettingChange) + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the current values
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Freeze or unfreeze client id and clean-session, driven by the connection state
    pub(crate) fn set_identity_locked(&mut self, locked: bool) {
        self.identity_locked = locked;
    }

    pub fn is_identity_locked(&self) -> bool {
        self.identity_locked
    }

    fn notify(&mut self, change: SettingChange) {
        debug!(?change, "Session setting changed");
        self.listeners.emit(&change);
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Ignored with a warning while connected
    pub fn set_client_id(&mut self, client_id: impl Into<String>) -> bool {
        let client_id = client_id.into();
        if self.config.client_id == client_id {
            return false;
        }
        if self.identity_locked {
            warn!(
                current = %self.config.client_id,
                requested = %client_id,
                "Client id cannot change while connected; ignoring"
            );
            return false;
        }
        self.config.client_id = client_id.clone();
        self.notify(SettingChange::ClientId(client_id));
        true
    }

    pub fn clean_session(&self) -> bool {
        self.config.clean_session
    }

    /// Ignored with a warning while connected
    pub fn set_clean_session(&mut self, clean_session: bool) -> bool {
        if self.config.clean_session == clean_session {
            return false;
        }
        if self.identity_locked {
            warn!(
                requested = clean_session,
                "Clean-session flag cannot change while connected; ignoring"
            );
            return false;
        }
        self.config.clean_session = clean_session;
        self.notify(SettingChange::CleanSession(clean_session));
        true
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> bool {
        let hostname = hostname.into();
        if !update(&mut self.config.hostname, hostname.clone()) {
            return false;
        }
        self.notify(SettingChange::Hostname(hostname));
        true
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn set_port(&mut self, port: u16) -> bool {
        if !update(&mut self.config.port, port) {
            return false;
        }
        self.notify(SettingChange::Port(port));
        true
    }

    pub fn keepalive(&self) -> u16 {
        self.config.keepalive_secs
    }

    pub fn set_keepalive(&mut self, keepalive_secs: u16) -> bool {
        if !update(&mut self.config.keepalive_secs, keepalive_secs) {
            return false;
        }
        self.notify(SettingChange::Keepalive(keepalive_secs));
        true
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) -> bool {
        let username = username.into();
        if !update(&mut self.config.username, username.clone()) {
            return false;
        }
        self.notify(SettingChange::Username(username));
        true
    }

    pub fn password(&self) -> &str {
        &self.config.password
    }

    pub fn set_password(&mut self, password: impl Into<String>) -> bool {
        let password = password.into();
        if !update(&mut self.config.password, password.clone()) {
            return false;
        }
        self.notify(SettingChange::Password(password));
        true
    }

    pub fn tls(&self) -> &TlsSettings {
        &self.config.tls
    }

    pub fn set_tls_enabled(&mut self, enabled: bool) -> bool {
        if !update(&mut self.config.tls.enabled, enabled) {
            return false;
        }
        self.notify(SettingChange::TlsEnabled(enabled));
        true
    }

    pub fn set_tls_insecure(&mut self, insecure: bool) -> bool {
        if !update(&mut self.config.tls.insecure, insecure) {
            return false;
        }
        self.notify(SettingChange::TlsInsecure(insecure));
        true
    }

    pub fn set_tls_ca_file(&mut self, path: Option<PathBuf>) -> bool {
        if !update(&mut self.config.tls.ca_file, path.clone()) {
            return false;
        }
        self.notify(SettingChange::TlsCaFile(path));
        true
    }

    pub fn set_tls_ca_path(&mut self, path: Option<PathBuf>) -> bool {
        if !update(&mut self.config.tls.ca_path, path.clone()) {
            return false;
        }
        self.notify(SettingChange::TlsCaPath(path));
        true
    }

    pub fn set_tls_cert_file(&mut self, path: Option<PathBuf>) -> bool {
        if !update(&mut self.config.tls.cert_file, path.clone()) {
            return false;
        }
        self.notify(SettingChange::TlsCertFile(path));
        true
    }

    pub fn set_tls_key_file(&mut self, path: Option<PathBuf>) -> bool {
        if !update(&mut self.config.tls.key_file, path.clone()) {
            return false;
        }
        self.notify(SettingChange::TlsKeyFile(path));
        true
    }

    pub fn will(&self) -> Option<&Will> {
        self.config.will.as_ref()
    }

    /// Set the will message used from the next connect on.
    ///
    /// The topic must be a concrete publish topic.
    pub fn set_will(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> AdapterResult<bool> {
        validate_publish_topic(topic).map_err(|e| e.into_adapter_error(topic))?;

        let will = Some(Will {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
        });
        if !update(&mut self.config.will, will.clone()) {
            return Ok(false);
        }
        self.notify(SettingChange::Will(will));
        Ok(true)
    }

    /// Remove the will message from the next connect on
    pub fn clear_will(&mut self) -> bool {
        if !update(&mut self.config.will, None) {
            return false;
        }
        self.notify(SettingChange::Will(None));
        true
    }
}
