//! Fake engine, fake event loop and event recorder for testing
//!
//! The fakes are cheap handles over shared state: clone one, move the clone
//! into the client, and keep inspecting the original after the client has
//! consumed (or dropped) its copy.

use crate::session::{Listeners, ListenerId, TlsSettings, Will};
use crate::transport::mqtt::{
    ClientEvent, EngineCallbacks, EngineError, EventLoop, LogLevel, Message, ProtocolEngine,
    WatchId,
};
use bytes::Bytes;
use rumqttc::QoS;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Descriptor reported by [`FakeEngine`] while its socket is open
pub const FAKE_SOCKET_FD: RawFd = 100;

/// A call made on [`FakeEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Reinitialise {
        client_id: String,
        clean_session: bool,
    },
    SetCredentials {
        username: Option<String>,
        password: Option<String>,
    },
    SetTls,
    SetWill(Option<Will>),
    Connect {
        host: String,
        port: u16,
        keepalive: u16,
    },
    Reconnect,
    Disconnect,
    LoopRead,
    LoopWrite,
    LoopMisc,
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

/// Callback delivered by [`FakeEngine`] during the next `loop_read`
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedCallback {
    Connect(u8),
    Disconnect(i32),
    Message(Message),
    Log(LogLevel, String),
    Error(String),
    Publish(u16),
    Subscribe(u16, Vec<u8>),
    Unsubscribe(u16),
}

#[derive(Debug)]
struct FakeEngineState {
    calls: Vec<EngineCall>,
    socket_fd: Option<RawFd>,
    open: bool,
    want_write: bool,
    confirm_disconnect: bool,
    script_on_disconnect: bool,
    script: VecDeque<ScriptedCallback>,
    fail_connect: Option<EngineError>,
    fail_reconnect: Option<EngineError>,
    fail_read: Option<EngineError>,
    fail_write: Option<EngineError>,
    fail_misc: Option<EngineError>,
    next_mid: u16,
}

impl Default for FakeEngineState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            socket_fd: Some(FAKE_SOCKET_FD),
            open: false,
            want_write: false,
            confirm_disconnect: true,
            script_on_disconnect: false,
            script: VecDeque::new(),
            fail_connect: None,
            fail_reconnect: None,
            fail_read: None,
            fail_write: None,
            fail_misc: None,
            next_mid: 0,
        }
    }
}

/// Scriptable protocol engine that records every call
#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Rc<RefCell<FakeEngineState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.borrow().calls.clone()
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: &EngineCall) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|recorded| *recorded == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    /// Descriptor exposed while open, `None` simulates an engine without a socket
    pub fn set_socket(&self, fd: Option<RawFd>) {
        self.state.borrow_mut().socket_fd = fd;
    }

    pub fn set_want_write(&self, want_write: bool) {
        self.state.borrow_mut().want_write = want_write;
    }

    /// Whether `disconnect` reports `on_disconnect(0)` before returning
    pub fn set_confirm_disconnect(&self, confirm: bool) {
        self.state.borrow_mut().confirm_disconnect = confirm;
    }

    /// Deliver scripted callbacks from inside `disconnect`, as an engine
    /// draining buffered input while it shuts down would
    pub fn set_script_on_disconnect(&self, enabled: bool) {
        self.state.borrow_mut().script_on_disconnect = enabled;
    }

    pub fn script(&self, callback: ScriptedCallback) {
        self.state.borrow_mut().script.push_back(callback);
    }

    pub fn script_connack(&self, code: u8) {
        self.script(ScriptedCallback::Connect(code));
    }

    pub fn script_message(&self, topic: &str, payload: &'static [u8]) {
        self.script(ScriptedCallback::Message(Message {
            mid: 0,
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos: QoS::AtMostOnce,
            retain: false,
        }));
    }

    pub fn fail_next_connect(&self, error: EngineError) {
        self.state.borrow_mut().fail_connect = Some(error);
    }

    pub fn fail_next_reconnect(&self, error: EngineError) {
        self.state.borrow_mut().fail_reconnect = Some(error);
    }

    pub fn fail_next_read(&self, error: EngineError) {
        self.state.borrow_mut().fail_read = Some(error);
    }

    pub fn fail_next_write(&self, error: EngineError) {
        self.state.borrow_mut().fail_write = Some(error);
    }

    pub fn fail_next_misc(&self, error: EngineError) {
        self.state.borrow_mut().fail_misc = Some(error);
    }

    fn record(&self, call: EngineCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn next_mid(&self) -> u16 {
        let mut state = self.state.borrow_mut();
        state.next_mid = state.next_mid.wrapping_add(1).max(1);
        state.next_mid
    }

    fn require_open(&self) -> Result<(), EngineError> {
        if self.state.borrow().open {
            Ok(())
        } else {
            Err(EngineError::NoConnection)
        }
    }

    /// Take the scripted callbacks out first so none runs under a borrow
    fn deliver_script(&self, callbacks: &mut dyn EngineCallbacks) {
        let script: Vec<ScriptedCallback> = self.state.borrow_mut().script.drain(..).collect();
        for callback in script {
            match callback {
                ScriptedCallback::Connect(code) => {
                    if code != 0 {
                        self.state.borrow_mut().open = false;
                    }
                    callbacks.on_connect(code);
                }
                ScriptedCallback::Disconnect(code) => {
                    self.state.borrow_mut().open = false;
                    callbacks.on_disconnect(code);
                }
                ScriptedCallback::Message(message) => callbacks.on_message(&message),
                ScriptedCallback::Log(level, text) => callbacks.on_log(level, &text),
                ScriptedCallback::Error(reason) => callbacks.on_error(&reason),
                ScriptedCallback::Publish(mid) => callbacks.on_publish(mid),
                ScriptedCallback::Subscribe(mid, granted) => callbacks.on_subscribe(mid, &granted),
                ScriptedCallback::Unsubscribe(mid) => callbacks.on_unsubscribe(mid),
            }
        }
    }

    fn fail_if_scripted(
        &self,
        take: impl FnOnce(&mut FakeEngineState) -> Option<EngineError>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.borrow_mut();
        match take(&mut *state) {
            Some(error) => {
                state.open = false;
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl ProtocolEngine for FakeEngine {
    fn reinitialise(&mut self, client_id: &str, clean_session: bool) -> Result<(), EngineError> {
        self.record(EngineCall::Reinitialise {
            client_id: client_id.to_string(),
            clean_session,
        });
        self.state.borrow_mut().open = false;
        Ok(())
    }

    fn set_credentials(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetCredentials {
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        });
        Ok(())
    }

    fn set_tls(&mut self, _tls: &TlsSettings) -> Result<(), EngineError> {
        self.record(EngineCall::SetTls);
        Ok(())
    }

    fn set_will(&mut self, will: Option<&Will>) -> Result<(), EngineError> {
        self.record(EngineCall::SetWill(will.cloned()));
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16, keepalive_secs: u16) -> Result<(), EngineError> {
        self.record(EngineCall::Connect {
            host: host.to_string(),
            port,
            keepalive: keepalive_secs,
        });
        self.fail_if_scripted(|state| state.fail_connect.take())?;
        self.state.borrow_mut().open = true;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), EngineError> {
        self.record(EngineCall::Reconnect);
        self.fail_if_scripted(|state| state.fail_reconnect.take())?;
        self.state.borrow_mut().open = true;
        Ok(())
    }

    fn disconnect(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.record(EngineCall::Disconnect);
        let (confirm, drain) = {
            let mut state = self.state.borrow_mut();
            state.open = false;
            (state.confirm_disconnect, state.script_on_disconnect)
        };
        if drain {
            self.deliver_script(callbacks);
        }
        if confirm {
            callbacks.on_disconnect(0);
        }
        Ok(())
    }

    fn socket(&self) -> Option<RawFd> {
        let state = self.state.borrow();
        if state.open {
            state.socket_fd
        } else {
            None
        }
    }

    fn want_write(&self) -> bool {
        let state = self.state.borrow();
        state.open && state.want_write
    }

    fn loop_read(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.record(EngineCall::LoopRead);
        self.fail_if_scripted(|state| state.fail_read.take())?;
        self.deliver_script(callbacks);
        Ok(())
    }

    fn loop_write(&mut self, _callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.record(EngineCall::LoopWrite);
        self.fail_if_scripted(|state| state.fail_write.take())?;
        self.state.borrow_mut().want_write = false;
        Ok(())
    }

    fn loop_misc(&mut self, _callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.record(EngineCall::LoopMisc);
        self.fail_if_scripted(|state| state.fail_misc.take())
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, EngineError> {
        self.record(EngineCall::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        self.require_open()?;
        Ok(self.next_mid())
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<u16, EngineError> {
        self.record(EngineCall::Unsubscribe {
            filter: filter.to_string(),
        });
        self.require_open()?;
        Ok(self.next_mid())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, EngineError> {
        self.record(EngineCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        self.require_open()?;
        Ok(match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => self.next_mid(),
        })
    }
}

/// Kind of a watch registered with [`FakeEventLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeWatchKind {
    Readable(RawFd),
    Writable(RawFd),
    Timer(Duration),
}

#[derive(Debug, Default)]
struct FakeLoopState {
    next_id: u64,
    watches: BTreeMap<WatchId, (FakeWatchKind, bool)>,
    registrations: usize,
    fail_readable: bool,
    fail_timer: bool,
}

/// Event loop that only records registrations; tests fire events by hand
#[derive(Debug, Clone, Default)]
pub struct FakeEventLoop {
    state: Rc<RefCell<FakeLoopState>>,
}

impl FakeEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_watch_count(&self) -> usize {
        self.state.borrow().watches.len()
    }

    /// Registrations made over the loop's lifetime, released ones included
    pub fn total_registrations(&self) -> usize {
        self.state.borrow().registrations
    }

    /// Enabled flag of a live watch, `None` once released
    pub fn is_enabled(&self, id: WatchId) -> Option<bool> {
        self.state.borrow().watches.get(&id).map(|(_, enabled)| *enabled)
    }

    pub fn kind(&self, id: WatchId) -> Option<FakeWatchKind> {
        self.state.borrow().watches.get(&id).map(|(kind, _)| *kind)
    }

    pub fn timer_interval(&self, id: WatchId) -> Option<Duration> {
        match self.kind(id)? {
            FakeWatchKind::Timer(interval) => Some(interval),
            _ => None,
        }
    }

    /// Live watches on `fd`
    pub fn watches_for(&self, fd: RawFd) -> Vec<WatchId> {
        self.state
            .borrow()
            .watches
            .iter()
            .filter(|(_, (kind, _))| {
                matches!(kind, FakeWatchKind::Readable(watched) | FakeWatchKind::Writable(watched) if *watched == fd)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn fail_next_readable(&self) {
        self.state.borrow_mut().fail_readable = true;
    }

    pub fn fail_next_timer(&self) {
        self.state.borrow_mut().fail_timer = true;
    }

    fn register(&self, kind: FakeWatchKind, enabled: bool) -> WatchId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.registrations += 1;
        let id = WatchId::new(state.next_id);
        state.watches.insert(id, (kind, enabled));
        id
    }
}

impl EventLoop for FakeEventLoop {
    fn watch_readable(&mut self, fd: RawFd) -> io::Result<WatchId> {
        if std::mem::take(&mut self.state.borrow_mut().fail_readable) {
            return Err(io::Error::new(io::ErrorKind::Other, "readable watch refused"));
        }
        Ok(self.register(FakeWatchKind::Readable(fd), true))
    }

    fn watch_writable(&mut self, fd: RawFd, enabled: bool) -> io::Result<WatchId> {
        Ok(self.register(FakeWatchKind::Writable(fd), enabled))
    }

    fn set_enabled(&mut self, id: WatchId, enabled: bool) {
        if let Some((_, flag)) = self.state.borrow_mut().watches.get_mut(&id) {
            *flag = enabled;
        }
    }

    fn start_timer(&mut self, interval: Duration) -> io::Result<WatchId> {
        if std::mem::take(&mut self.state.borrow_mut().fail_timer) {
            return Err(io::Error::new(io::ErrorKind::Other, "timer refused"));
        }
        Ok(self.register(FakeWatchKind::Timer(interval), true))
    }

    fn unwatch(&mut self, id: WatchId) {
        self.state.borrow_mut().watches.remove(&id);
    }
}

/// Collects client events in emission order
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Rc<RefCell<Vec<ClientEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the recorder as a listener
    pub fn attach(&self, listeners: &mut Listeners<ClientEvent>) -> ListenerId {
        let sink = self.clone();
        listeners.add(move |event| sink.push(event.clone()))
    }

    pub fn push(&self, event: ClientEvent) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.borrow().clone()
    }

    /// Event kinds in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(ClientEvent::kind).collect()
    }

    /// Number of events of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}
