//! Event-driven MQTT client
//!
//! [`MqttClient`] combines a [`ProtocolEngine`] with the host's [`EventLoop`].
//! All operations are synchronous and run to completion on the caller's
//! thread. Network progress happens only when the host reports a loop event
//! through [`MqttClient::handle_event`].

use super::bridge::{IoBridge, Notifier, NotifierHandles, DEFAULT_MISC_INTERVAL};
use super::connection::{can_publish, prepare_connect, ConnectionEvent, ConnectionState};
use super::engine::{EngineError, ProtocolEngine};
use super::event_loop::{EventLoop, LoopEvent};
use super::events::ClientEvent;
use super::message_handler::{PendingRequests, RequestKind, SessionCore};
use super::registry::TopicRegistry;
use super::topics::{validate_publish_topic, validate_subscription_filter};
use crate::error::{AdapterError, AdapterResult};
use crate::session::{ListenerId, SessionConfig, SessionSettings};
use bytes::Bytes;
use rumqttc::QoS;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest remaining length an MQTT packet can encode
const MAX_PACKET_REMAINING_LEN: usize = 268_435_455;

/// Tunables that are not part of the session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Period of the housekeeping timer driving keepalive and timeouts
    pub misc_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            misc_interval: DEFAULT_MISC_INTERVAL,
        }
    }
}

/// One MQTT session bound to a host event loop
pub struct MqttClient<E: ProtocolEngine, L: EventLoop> {
    engine: E,
    core: SessionCore<L>,
    engine_configured: bool,
}

impl<E: ProtocolEngine, L: EventLoop> MqttClient<E, L> {
    pub fn new(engine: E, event_loop: L, config: SessionConfig) -> Self {
        Self::with_options(engine, event_loop, config, ClientOptions::default())
    }

    pub fn with_options(
        engine: E,
        event_loop: L,
        config: SessionConfig,
        options: ClientOptions,
    ) -> Self {
        let bridge = IoBridge::new(event_loop, options.misc_interval);
        Self {
            engine,
            core: SessionCore::new(SessionSettings::new(config), bridge),
            engine_configured: false,
        }
    }

    /// Start connecting with the current settings.
    ///
    /// Only valid while disconnected. Returns once the CONNECT packet is
    /// queued; `Connected` or an error event follows from the event loop.
    pub fn connect_to_host(&mut self) -> AdapterResult<()> {
        let state = self.core.state();
        if state != ConnectionState::Disconnected {
            return Err(AdapterError::AlreadyConnected { state });
        }

        let params = prepare_connect(self.core.settings().config())?;
        let config = self.core.settings().config();
        info!(
            host = %params.host,
            port = params.port,
            client_id = %params.client_id,
            clean_session = params.clean_session,
            tls = config.tls.enabled,
            "Connecting to MQTT broker"
        );

        self.engine
            .reinitialise(&params.client_id, params.clean_session)?;
        self.engine
            .set_credentials(config.username(), config.password())?;
        self.engine.set_tls(&config.tls)?;
        self.engine.set_will(config.will.as_ref())?;
        self.engine
            .connect(&params.host, params.port, params.keepalive_secs)?;
        self.engine_configured = true;

        self.start_session()
    }

    /// Close the session.
    ///
    /// The session is closed before the engine is told, so exactly one
    /// `Disconnected` event is emitted and callbacks the engine delivers while
    /// shutting down (a late CONNACK included) are ignored.
    pub fn disconnect_from_host(&mut self) -> AdapterResult<()> {
        let state = self.core.state();
        if state == ConnectionState::Disconnected {
            return Err(AdapterError::NotConnected { state });
        }

        let request = self.core.pending_mut().record_disconnect();
        info!(%state, request, "Disconnecting from MQTT broker");
        self.core.transition(ConnectionEvent::Closed(0));
        let result = self.engine.disconnect(&mut self.core);

        if let Err(e) = &result {
            warn!("Engine reported error while disconnecting: {}", e);
        }
        result.map_err(AdapterError::from)
    }

    /// Connect again reusing the identity, credentials, TLS and will of the
    /// last successful `connect_to_host`.
    pub fn reconnect_to_host(&mut self) -> AdapterResult<()> {
        if !self.engine_configured {
            return self.connect_to_host();
        }

        info!(state = %self.core.state(), "Reconnecting to MQTT broker");
        self.core.bridge_mut().detach();
        self.core.transition(ConnectionEvent::Closed(0));
        self.engine.reconnect()?;
        self.start_session()
    }

    /// Disconnect if needed and release every notifier. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.core.state() != ConnectionState::Disconnected {
            if let Err(e) = self.disconnect_from_host() {
                warn!("Error during shutdown disconnect: {}", e);
            }
        }
        self.core.bridge_mut().detach();
    }

    /// Drive the engine for a fired watch or timer.
    ///
    /// Returns `false` when the event does not belong to this session, which
    /// includes events for watches that were already released.
    pub fn handle_event(&mut self, event: LoopEvent) -> bool {
        let Some(notifier) = self.core.bridge().classify(event) else {
            debug!(id = event.id.as_u64(), "Ignoring event for released watch");
            return false;
        };

        let result = match notifier {
            Notifier::Read => self.engine.loop_read(&mut self.core),
            Notifier::Write => {
                if self.engine.want_write() {
                    self.engine.loop_write(&mut self.core)
                } else {
                    Ok(())
                }
            }
            Notifier::Timer => self.engine.loop_misc(&mut self.core),
        };

        match result {
            Ok(()) => self.refresh_write_interest(),
            Err(e) => self.fail_transport(notifier, e),
        }
        true
    }

    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> AdapterResult<u16> {
        self.ensure_connected()?;
        validate_subscription_filter(filter).map_err(|e| e.into_adapter_error(filter))?;

        let mid = self.engine.subscribe(filter, qos)?;
        debug!(filter, ?qos, mid, "Subscribe requested");
        self.core
            .pending_mut()
            .record(RequestKind::Subscribe, mid, filter);
        self.refresh_write_interest();
        Ok(mid)
    }

    /// Subscribe and route messages on `filter` to `id`
    pub fn subscribe_with_id(&mut self, filter: &str, qos: QoS, id: i32) -> AdapterResult<u16> {
        let mid = self.subscribe(filter, qos)?;
        self.core.registry_mut().add(filter, id);
        Ok(mid)
    }

    /// Unsubscribe and drop any identifier registered for `filter`
    pub fn unsubscribe(&mut self, filter: &str) -> AdapterResult<u16> {
        self.ensure_connected()?;
        validate_subscription_filter(filter).map_err(|e| e.into_adapter_error(filter))?;

        let mid = self.engine.unsubscribe(filter)?;
        debug!(filter, mid, "Unsubscribe requested");
        self.core
            .pending_mut()
            .record(RequestKind::Unsubscribe, mid, filter);
        self.core.registry_mut().remove(filter);
        self.refresh_write_interest();
        Ok(mid)
    }

    /// Queue a message. Returns the message id, 0 for QoS 0.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> AdapterResult<u16> {
        self.ensure_connected()?;
        validate_publish_topic(topic).map_err(|e| e.into_adapter_error(topic))?;

        let payload = payload.into();
        let overhead = 2 + topic.len() + if qos == QoS::AtMostOnce { 0 } else { 2 };
        if payload.len() + overhead > MAX_PACKET_REMAINING_LEN {
            return Err(AdapterError::PayloadTooLarge(payload.len()));
        }

        let bytes = payload.len();
        let mid = self.engine.publish(topic, payload, qos, retain)?;
        debug!(topic, bytes, ?qos, retain, mid, "Publish queued");
        self.core
            .pending_mut()
            .record(RequestKind::Publish, mid, topic);
        self.refresh_write_interest();
        Ok(mid)
    }

    pub fn publish_text(
        &mut self,
        topic: &str,
        text: &str,
        qos: QoS,
        retain: bool,
    ) -> AdapterResult<u16> {
        self.publish(topic, Bytes::copy_from_slice(text.as_bytes()), qos, retain)
    }

    /// Associate `topic` with `id` without subscribing
    pub fn add_topic_match(&mut self, topic: &str, id: i32) {
        self.core.registry_mut().add(topic, id);
    }

    pub fn remove_topic_match(&mut self, topic: &str) -> bool {
        self.core.registry_mut().remove(topic)
    }

    /// Set the will message used from the next connect on
    pub fn set_will(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> AdapterResult<bool> {
        self.core
            .settings_mut()
            .set_will(topic, payload, qos, retain)
    }

    pub fn clear_will(&mut self) -> bool {
        self.core.settings_mut().clear_will()
    }

    /// Register a synchronous event listener
    pub fn on_event<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ClientEvent) + 'static,
    {
        self.core.listeners_mut().add(listener)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.core.listeners_mut().remove(id)
    }

    /// Receive every subsequent event through an unbounded channel
    pub fn event_channel(&mut self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (_, rx) = self.core.listeners_mut().channel();
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state() == ConnectionState::Connected
    }

    /// Whether the engine still holds unsent output
    pub fn has_pending_output(&self) -> bool {
        self.core.state() != ConnectionState::Disconnected && self.engine.want_write()
    }

    pub fn settings(&self) -> &SessionSettings {
        self.core.settings()
    }

    pub fn settings_mut(&mut self) -> &mut SessionSettings {
        self.core.settings_mut()
    }

    pub fn registry(&self) -> &TopicRegistry {
        self.core.registry()
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        self.core.pending()
    }

    pub fn notifier_handles(&self) -> Option<NotifierHandles> {
        self.core.bridge().handles()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn event_loop(&self) -> &L {
        self.core.bridge().event_loop()
    }

    pub fn event_loop_mut(&mut self) -> &mut L {
        self.core.bridge_mut().event_loop_mut()
    }

    fn ensure_connected(&self) -> AdapterResult<()> {
        let state = self.core.state();
        if !can_publish(state) {
            return Err(AdapterError::NotConnected { state });
        }
        Ok(())
    }

    /// Register notifiers on the engine socket and enter Connecting
    fn start_session(&mut self) -> AdapterResult<()> {
        let Some(fd) = self.engine.socket() else {
            error!("Engine reported a successful connect without a socket");
            return Err(EngineError::NoConnection.into());
        };

        if let Err(e) = self
            .core
            .bridge_mut()
            .attach(fd, self.engine.want_write())
        {
            error!(fd, "Failed to register socket notifiers: {}", e);
            // State is still Disconnected, so the engine's confirmation is ignored.
            if let Err(close_err) = self.engine.disconnect(&mut self.core) {
                debug!("Closing unregistered socket failed: {}", close_err);
            }
            return Err(EngineError::Io(e).into());
        }

        self.core.transition(ConnectionEvent::ConnectStarted);
        Ok(())
    }

    fn refresh_write_interest(&mut self) {
        let want_write = self.engine.want_write();
        self.core.bridge_mut().set_write_interest(want_write);
    }

    fn fail_transport(&mut self, notifier: Notifier, error: EngineError) {
        error!(?notifier, "MQTT engine I/O failed: {}", error);
        self.core.transport_failed(&error);
    }
}

impl<E: ProtocolEngine, L: EventLoop> Drop for MqttClient<E, L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
