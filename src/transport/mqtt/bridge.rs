//! Readiness notifiers for the engine socket
//!
//! [`IoBridge`] owns the only set of watches the session ever registers with
//! the host loop: one readable watch, one writable watch and one periodic
//! housekeeping timer. It classifies loop events so the client knows which
//! engine entry point to drive.

use super::event_loop::{EventLoop, LoopEvent, WatchId};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// Default period of the housekeeping timer
pub const DEFAULT_MISC_INTERVAL: Duration = Duration::from_secs(1);

/// Watches registered for one engine socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierHandles {
    pub fd: RawFd,
    pub read: WatchId,
    pub write: WatchId,
    pub timer: WatchId,
}

/// Which engine entry point a loop event maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notifier {
    Read,
    Write,
    Timer,
}

#[derive(Debug)]
pub struct IoBridge<L> {
    event_loop: L,
    handles: Option<NotifierHandles>,
    write_enabled: bool,
    misc_interval: Duration,
}

impl<L: EventLoop> IoBridge<L> {
    pub fn new(event_loop: L, misc_interval: Duration) -> Self {
        Self {
            event_loop,
            handles: None,
            write_enabled: false,
            misc_interval,
        }
    }

    /// Register the notifiers for `fd`.
    ///
    /// Attaching the descriptor that is already attached only refreshes the
    /// write interest. Any other attached descriptor is detached first. On
    /// failure every watch registered by this call is released again.
    pub fn attach(&mut self, fd: RawFd, want_write: bool) -> io::Result<()> {
        if let Some(handles) = self.handles {
            if handles.fd == fd {
                self.set_write_interest(want_write);
                return Ok(());
            }
            self.detach();
        }

        let read = self.event_loop.watch_readable(fd)?;
        let write = match self.event_loop.watch_writable(fd, want_write) {
            Ok(id) => id,
            Err(e) => {
                self.event_loop.unwatch(read);
                return Err(e);
            }
        };
        let timer = match self.event_loop.start_timer(self.misc_interval) {
            Ok(id) => id,
            Err(e) => {
                self.event_loop.unwatch(write);
                self.event_loop.unwatch(read);
                return Err(e);
            }
        };

        debug!(fd, ?read, ?write, ?timer, "Attached socket notifiers");
        self.handles = Some(NotifierHandles {
            fd,
            read,
            write,
            timer,
        });
        self.write_enabled = want_write;
        Ok(())
    }

    /// Release every notifier. Returns whether anything was attached.
    pub fn detach(&mut self) -> bool {
        match self.handles.take() {
            Some(handles) => {
                self.event_loop.unwatch(handles.timer);
                self.event_loop.unwatch(handles.write);
                self.event_loop.unwatch(handles.read);
                self.write_enabled = false;
                debug!(fd = handles.fd, "Detached socket notifiers");
                true
            }
            None => false,
        }
    }

    /// Enable the writable watch exactly when output is pending
    pub fn set_write_interest(&mut self, want_write: bool) {
        let Some(handles) = self.handles else {
            return;
        };
        if self.write_enabled != want_write {
            trace!(fd = handles.fd, want_write, "Updating write interest");
            self.event_loop.set_enabled(handles.write, want_write);
            self.write_enabled = want_write;
        }
    }

    /// Map a loop event to a notifier. Events for released watches yield `None`.
    pub fn classify(&self, event: LoopEvent) -> Option<Notifier> {
        let handles = self.handles?;
        if event.id == handles.read {
            Some(Notifier::Read)
        } else if event.id == handles.write {
            Some(Notifier::Write)
        } else if event.id == handles.timer {
            Some(Notifier::Timer)
        } else {
            None
        }
    }

    pub fn handles(&self) -> Option<NotifierHandles> {
        self.handles
    }

    pub fn is_attached(&self) -> bool {
        self.handles.is_some()
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    pub fn misc_interval(&self) -> Duration {
        self.misc_interval
    }

    pub fn event_loop(&self) -> &L {
        &self.event_loop
    }

    pub fn event_loop_mut(&mut self) -> &mut L {
        &mut self.event_loop
    }
}
