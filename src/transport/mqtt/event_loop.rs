//! Host event loop contract
//!
//! The adapter never blocks and never spawns. It asks the host loop for
//! readiness watches on the engine socket plus a periodic timer, and the host
//! reports each firing back through `MqttClient::handle_event`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Identifier of a registered watch or timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A watch or timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEvent {
    pub id: WatchId,
}

impl LoopEvent {
    pub fn new(id: WatchId) -> Self {
        Self { id }
    }
}

/// Registration surface of the host event loop
pub trait EventLoop {
    /// Report `fd` readable while the watch is enabled; starts enabled
    fn watch_readable(&mut self, fd: RawFd) -> io::Result<WatchId>;

    /// Report `fd` writable while the watch is enabled
    fn watch_writable(&mut self, fd: RawFd, enabled: bool) -> io::Result<WatchId>;

    /// Enable or disable a readiness watch
    fn set_enabled(&mut self, id: WatchId, enabled: bool);

    /// Fire every `interval` until unwatched
    fn start_timer(&mut self, interval: Duration) -> io::Result<WatchId>;

    /// Release a watch or timer. Unknown ids are ignored.
    fn unwatch(&mut self, id: WatchId);
}

impl<L: EventLoop + ?Sized> EventLoop for Box<L> {
    fn watch_readable(&mut self, fd: RawFd) -> io::Result<WatchId> {
        (**self).watch_readable(fd)
    }

    fn watch_writable(&mut self, fd: RawFd, enabled: bool) -> io::Result<WatchId> {
        (**self).watch_writable(fd, enabled)
    }

    fn set_enabled(&mut self, id: WatchId, enabled: bool) {
        (**self).set_enabled(id, enabled)
    }

    fn start_timer(&mut self, interval: Duration) -> io::Result<WatchId> {
        (**self).start_timer(interval)
    }

    fn unwatch(&mut self, id: WatchId) {
        (**self).unwatch(id)
    }
}
