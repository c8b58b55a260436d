//! Engine callback dispatch for the MQTT session
//!
//! [`SessionCore`] is everything the client owns besides the engine itself:
//! settings, connection state, topic registry, pending requests, notifiers
//! and event listeners. It implements [`EngineCallbacks`], so the engine can
//! be handed `&mut core` while the client keeps `&mut engine`.

use super::bridge::IoBridge;
use super::connection::{log_state_transition, next_state, ConnectionEvent, ConnectionState};
use super::engine::{EngineCallbacks, EngineError, LogLevel, Message};
use super::event_loop::EventLoop;
use super::events::{ClientEvent, SessionError};
use super::registry::TopicRegistry;
use crate::error::{sanitize_error_message, StatusCode};
use crate::session::{Listeners, SessionSettings};
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

/// Kind of request awaiting an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub topic: String,
}

/// Correlation of engine message ids with the requests that produced them
#[derive(Debug, Default)]
pub struct PendingRequests {
    last_disconnect: Option<u16>,
    last_subscribe: Option<u16>,
    last_unsubscribe: Option<u16>,
    last_publish: Option<u16>,
    in_flight: HashMap<u16, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a request. Id 0 (QoS 0 publish) is never acknowledged and is not tracked.
    pub fn record(&mut self, kind: RequestKind, mid: u16, topic: &str) {
        match kind {
            RequestKind::Subscribe => self.last_subscribe = Some(mid),
            RequestKind::Unsubscribe => self.last_unsubscribe = Some(mid),
            RequestKind::Publish => self.last_publish = Some(mid),
        }
        if mid != 0 {
            self.in_flight.insert(
                mid,
                PendingRequest {
                    kind,
                    topic: topic.to_string(),
                },
            );
        }
    }

    /// Number the next disconnect request.
    ///
    /// DISCONNECT carries no packet identifier, so the session counts these
    /// itself. The counter skips 0 like engine-assigned ids do.
    pub fn record_disconnect(&mut self) -> u16 {
        let next = match self.last_disconnect {
            Some(u16::MAX) | None => 1,
            Some(last) => last + 1,
        };
        self.last_disconnect = Some(next);
        next
    }

    /// Resolve an acknowledgement, returning the topic of the matching request
    pub fn complete(&mut self, kind: RequestKind, mid: u16) -> Option<String> {
        match self.in_flight.get(&mid) {
            Some(request) if request.kind == kind => {
                self.in_flight.remove(&mid).map(|request| request.topic)
            }
            _ => None,
        }
    }

    pub fn get(&self, mid: u16) -> Option<&PendingRequest> {
        self.in_flight.get(&mid)
    }

    pub fn last_disconnect(&self) -> Option<u16> {
        self.last_disconnect
    }

    pub fn last_subscribe(&self) -> Option<u16> {
        self.last_subscribe
    }

    pub fn last_unsubscribe(&self) -> Option<u16> {
        self.last_unsubscribe
    }

    pub fn last_publish(&self) -> Option<u16> {
        self.last_publish
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Forget requests that can no longer be acknowledged
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

/// Session state shared by the client operations and the engine callbacks
pub struct SessionCore<L> {
    settings: SessionSettings,
    state: ConnectionState,
    registry: TopicRegistry,
    pending: PendingRequests,
    bridge: IoBridge<L>,
    listeners: Listeners<ClientEvent>,
}

impl<L: EventLoop> SessionCore<L> {
    pub fn new(settings: SessionSettings, bridge: IoBridge<L>) -> Self {
        Self {
            settings,
            state: ConnectionState::Disconnected,
            registry: TopicRegistry::new(),
            pending: PendingRequests::new(),
            bridge,
            listeners: Listeners::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SessionSettings {
        &mut self.settings
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TopicRegistry {
        &mut self.registry
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingRequests {
        &mut self.pending
    }

    pub fn bridge(&self) -> &IoBridge<L> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut IoBridge<L> {
        &mut self.bridge
    }

    pub fn listeners_mut(&mut self) -> &mut Listeners<ClientEvent> {
        &mut self.listeners
    }

    pub(crate) fn emit(&mut self, event: ClientEvent) {
        trace!(kind = event.kind(), "Emitting client event");
        self.listeners.emit(&event);
    }

    /// Apply `event` to the connection state and emit the resulting events.
    ///
    /// Returns `false` when the event does not apply in the current state.
    /// Every transition into Disconnected releases the notifiers and drops
    /// unacknowledged requests.
    pub(crate) fn transition(&mut self, event: ConnectionEvent) -> bool {
        let from = self.state;
        let Some(to) = next_state(from, &event) else {
            debug!(state = %from, ?event, "Ignoring connection event");
            return false;
        };

        log_state_transition(from, to, &event);
        self.state = to;
        self.settings
            .set_identity_locked(to == ConnectionState::Connected);
        if to == ConnectionState::Disconnected {
            self.bridge.detach();
            self.pending.clear();
        }

        match event {
            ConnectionEvent::ConnectStarted => self.emit(ClientEvent::Connecting),
            ConnectionEvent::ConnAckAccepted => self.emit(ClientEvent::Connected),
            ConnectionEvent::ConnAckRefused(code) => {
                self.emit(ClientEvent::Error(SessionError::Refused { code }))
            }
            ConnectionEvent::Closed(code) => self.emit(ClientEvent::Disconnected { code }),
            ConnectionEvent::TransportFailed(reason) => {
                self.emit(ClientEvent::Error(SessionError::Transport { reason }));
                self.emit(ClientEvent::Disconnected {
                    code: StatusCode::ConnectionLost.as_i32(),
                });
            }
        }

        let was_connected = from == ConnectionState::Connected;
        let is_connected = to == ConnectionState::Connected;
        if was_connected != is_connected {
            self.emit(ClientEvent::ConnectedChanged(is_connected));
        }
        true
    }

    /// Fatal I/O failure reported by one of the engine loop entry points
    pub(crate) fn transport_failed(&mut self, error: &EngineError) {
        let reason = sanitize_error_message(&error.to_string());
        self.transition(ConnectionEvent::TransportFailed(reason));
    }
}

impl<L: EventLoop> EngineCallbacks for SessionCore<L> {
    fn on_connect(&mut self, code: u8) {
        let event = if code == 0 {
            ConnectionEvent::ConnAckAccepted
        } else {
            ConnectionEvent::ConnAckRefused(code)
        };
        if !self.transition(event) {
            warn!(code, state = %self.state, "Discarding CONNACK outside of a connect attempt");
        }
    }

    fn on_disconnect(&mut self, code: i32) {
        self.transition(ConnectionEvent::Closed(code));
    }

    fn on_message(&mut self, message: &Message) {
        let id = self.registry.lookup(&message.topic);
        debug!(
            topic = %message.topic,
            bytes = message.payload.len(),
            id,
            "Received message"
        );

        self.emit(ClientEvent::Message {
            message: message.clone(),
            id,
        });
        if let Some(id) = id {
            self.emit(ClientEvent::TopicMatch {
                topic: message.topic.clone(),
                id,
            });
        }
    }

    fn on_log(&mut self, level: LogLevel, text: &str) {
        match level {
            LogLevel::Debug => debug!(target: "mqtt_engine", "{}", text),
            LogLevel::Info | LogLevel::Notice => info!(target: "mqtt_engine", "{}", text),
            LogLevel::Warning => warn!(target: "mqtt_engine", "{}", text),
            LogLevel::Error => error!(target: "mqtt_engine", "{}", text),
        }
        self.emit(ClientEvent::Log {
            level,
            message: text.to_string(),
        });
    }

    fn on_error(&mut self, reason: &str) {
        let reason = sanitize_error_message(reason);
        warn!("MQTT engine error: {}", reason);
        self.emit(ClientEvent::Error(SessionError::Engine { reason }));
    }

    fn on_publish(&mut self, mid: u16) {
        let topic = self.pending.complete(RequestKind::Publish, mid);
        debug!(mid, ?topic, "Publish completed");
        self.emit(ClientEvent::Published { mid, topic });
    }

    fn on_subscribe(&mut self, mid: u16, granted: &[u8]) {
        let topic = self.pending.complete(RequestKind::Subscribe, mid);
        if granted.iter().any(|&code| code >= 0x80) {
            warn!(mid, ?topic, ?granted, "Broker rejected subscription");
        } else {
            debug!(mid, ?topic, ?granted, "Subscription acknowledged");
        }
        self.emit(ClientEvent::Subscribed {
            mid,
            topic,
            granted: granted.to_vec(),
        });
    }

    fn on_unsubscribe(&mut self, mid: u16) {
        let topic = self.pending.complete(RequestKind::Unsubscribe, mid);
        debug!(mid, ?topic, "Unsubscribe acknowledged");
        self.emit(ClientEvent::Unsubscribed { mid, topic });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{EventRecorder, FakeEventLoop};
    use crate::transport::mqtt::bridge::DEFAULT_MISC_INTERVAL;
    use bytes::Bytes;
    use rumqttc::QoS;

    fn core() -> (SessionCore<FakeEventLoop>, FakeEventLoop, EventRecorder) {
        let event_loop = FakeEventLoop::new();
        let bridge = IoBridge::new(event_loop.clone(), DEFAULT_MISC_INTERVAL);
        let mut core = SessionCore::new(SessionSettings::default(), bridge);
        let recorder = EventRecorder::new();
        recorder.attach(core.listeners_mut());
        (core, event_loop, recorder)
    }

    fn connecting_core() -> (SessionCore<FakeEventLoop>, FakeEventLoop, EventRecorder) {
        let (mut core, event_loop, recorder) = core();
        core.bridge_mut().attach(5, false).unwrap();
        assert!(core.transition(ConnectionEvent::ConnectStarted));
        recorder.clear();
        (core, event_loop, recorder)
    }

    fn message(topic: &str) -> Message {
        Message {
            mid: 0,
            topic: topic.to_string(),
            payload: Bytes::from_static(b"21.5"),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[test]
    fn test_connack_accepted() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.on_connect(0);

        assert_eq!(core.state(), ConnectionState::Connected);
        assert!(core.settings().is_identity_locked());
        assert_eq!(
            recorder.events(),
            vec![ClientEvent::Connected, ClientEvent::ConnectedChanged(true)]
        );
    }

    #[test]
    fn test_connack_refused_detaches() {
        let (mut core, event_loop, recorder) = connecting_core();
        core.on_connect(5);

        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(!core.bridge().is_attached());
        assert_eq!(event_loop.active_watch_count(), 0);
        assert_eq!(
            recorder.events(),
            vec![ClientEvent::Error(SessionError::Refused { code: 5 })]
        );

        core.on_disconnect(5);
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_connack_ignored_when_disconnected() {
        let (mut core, _event_loop, recorder) = core();
        core.on_connect(0);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_disconnect_after_connected() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.on_connect(0);
        recorder.clear();

        core.on_disconnect(7);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(!core.settings().is_identity_locked());
        assert_eq!(
            recorder.events(),
            vec![
                ClientEvent::Disconnected { code: 7 },
                ClientEvent::ConnectedChanged(false)
            ]
        );
    }

    #[test]
    fn test_transport_failure_emits_error_then_disconnected() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.transport_failed(&EngineError::ConnectionLost("reset by peer".to_string()));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ClientEvent::Error(SessionError::Transport { reason }) if reason.contains("reset by peer")
        ));
        assert_eq!(events[1], ClientEvent::Disconnected { code: 7 });
    }

    #[test]
    fn test_message_routing_through_registry() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.registry_mut().add("sensors/temp", 42);

        core.on_message(&message("sensors/temp"));
        core.on_message(&message("sensors/other"));

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ClientEvent::Message { id: Some(42), .. }));
        assert_eq!(
            events[1],
            ClientEvent::TopicMatch {
                topic: "sensors/temp".to_string(),
                id: 42
            }
        );
        assert!(matches!(&events[2], ClientEvent::Message { id: None, message } if message.topic == "sensors/other"));
    }

    #[test]
    fn test_engine_error_keeps_state() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.on_error("tls handshake failed password=hunter2");

        assert_eq!(core.state(), ConnectionState::Connecting);
        let events = recorder.events();
        assert!(matches!(
            &events[0],
            ClientEvent::Error(SessionError::Engine { reason }) if !reason.contains("hunter2")
        ));
    }

    #[test]
    fn test_log_is_forwarded() {
        let (mut core, _event_loop, recorder) = core();
        core.on_log(LogLevel::Notice, "sending CONNECT");
        assert_eq!(
            recorder.events(),
            vec![ClientEvent::Log {
                level: LogLevel::Notice,
                message: "sending CONNECT".to_string()
            }]
        );
    }

    #[test]
    fn test_acknowledgements_resolve_pending_requests() {
        let (mut core, _event_loop, recorder) = connecting_core();
        core.pending_mut().record(RequestKind::Subscribe, 1, "a/#");
        core.pending_mut().record(RequestKind::Publish, 2, "a/b");

        core.on_subscribe(1, &[1]);
        core.on_publish(2);
        core.on_unsubscribe(3);

        assert!(core.pending().is_empty());
        assert_eq!(
            recorder.events(),
            vec![
                ClientEvent::Subscribed {
                    mid: 1,
                    topic: Some("a/#".to_string()),
                    granted: vec![1]
                },
                ClientEvent::Published {
                    mid: 2,
                    topic: Some("a/b".to_string())
                },
                ClientEvent::Unsubscribed { mid: 3, topic: None },
            ]
        );
    }

    #[test]
    fn test_pending_requests_match_kind() {
        let mut pending = PendingRequests::new();
        pending.record(RequestKind::Publish, 0, "a");
        assert!(pending.is_empty());
        assert_eq!(pending.last_publish(), Some(0));

        pending.record(RequestKind::Unsubscribe, 4, "b");
        assert_eq!(pending.complete(RequestKind::Subscribe, 4), None);
        assert_eq!(pending.complete(RequestKind::Unsubscribe, 4), Some("b".to_string()));
        assert_eq!(pending.last_unsubscribe(), Some(4));
        assert_eq!(pending.last_subscribe(), None);
    }

    #[test]
    fn test_disconnect_counter_skips_zero() {
        let mut pending = PendingRequests::new();
        assert_eq!(pending.record_disconnect(), 1);
        assert_eq!(pending.record_disconnect(), 2);

        pending.last_disconnect = Some(u16::MAX);
        assert_eq!(pending.record_disconnect(), 1);
        pending.clear();
        assert_eq!(pending.last_disconnect(), Some(1));
    }
}
