//! [`EventLoop`] implementation on the tokio reactor
//!
//! Each descriptor is registered with the reactor once through
//! [`AsyncFd`], however many watches point at it. Readiness is reported by
//! [`TokioEventLoop::next_event`], which the host awaits and feeds into
//! `MqttClient::handle_event`.

use crate::transport::mqtt::{EventLoop, LoopEvent, MqttClient, ProtocolEngine, WatchId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::{poll_fn, Future};
use std::io;
use std::ops::Bound;
use std::os::unix::io::RawFd;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

enum WatchKind {
    Readable(RawFd),
    Writable(RawFd),
    Timer(Interval),
}

struct Watch {
    kind: WatchKind,
    enabled: bool,
}

struct Registration {
    async_fd: AsyncFd<RawFd>,
    users: usize,
}

/// Host event loop backed by the current tokio runtime.
///
/// # Panics
///
/// Registering a descriptor or timer outside a tokio runtime panics, as
/// with any tokio I/O resource.
#[derive(Default)]
pub struct TokioEventLoop {
    next_id: u64,
    watches: BTreeMap<WatchId, Watch>,
    registrations: HashMap<RawFd, Registration>,
    /// Writable watches to report without waiting for a readiness edge
    kicked: VecDeque<WatchId>,
    /// Last reported watch, polling resumes after it
    cursor: Option<WatchId>,
}

impl TokioEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live watches and timers
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Number of descriptors registered with the reactor
    pub fn registered_fds(&self) -> usize {
        self.registrations.len()
    }

    /// Wait for the next enabled watch or timer to fire
    pub async fn next_event(&mut self) -> LoopEvent {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Poll every enabled watch once, round robin after the last reported one
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<LoopEvent> {
        while let Some(id) = self.kicked.pop_front() {
            if self.watches.get(&id).is_some_and(|watch| watch.enabled) {
                trace!(id = id.as_u64(), "Reporting kicked writable watch");
                return self.report(id);
            }
        }

        let ids: Vec<WatchId> = match self.cursor {
            Some(cursor) => self
                .watches
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .chain(self.watches.range(..=cursor))
                .map(|(id, _)| *id)
                .collect(),
            None => self.watches.keys().copied().collect(),
        };

        for id in ids {
            let Some(watch) = self.watches.get_mut(&id) else {
                continue;
            };
            if !watch.enabled {
                continue;
            }

            let fired = match &mut watch.kind {
                WatchKind::Readable(fd) => {
                    poll_readiness(&self.registrations, *fd, Interest::READABLE, cx)
                }
                WatchKind::Writable(fd) => {
                    poll_readiness(&self.registrations, *fd, Interest::WRITABLE, cx)
                }
                WatchKind::Timer(interval) => interval.poll_tick(cx).is_ready(),
            };

            if fired {
                return self.report(id);
            }
        }
        Poll::Pending
    }

    fn report(&mut self, id: WatchId) -> Poll<LoopEvent> {
        self.cursor = Some(id);
        Poll::Ready(LoopEvent::new(id))
    }

    fn allocate(&mut self, kind: WatchKind, enabled: bool) -> WatchId {
        self.next_id += 1;
        let id = WatchId::new(self.next_id);
        self.watches.insert(id, Watch { kind, enabled });
        id
    }

    fn register_fd(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(registration) = self.registrations.get_mut(&fd) {
            registration.users += 1;
            return Ok(());
        }

        let async_fd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
        debug!(fd, "Registered descriptor with reactor");
        self.registrations.insert(
            fd,
            Registration {
                async_fd,
                users: 1,
            },
        );
        Ok(())
    }

    fn release_fd(&mut self, fd: RawFd) {
        let Some(registration) = self.registrations.get_mut(&fd) else {
            return;
        };
        registration.users -= 1;
        if registration.users == 0 {
            self.registrations.remove(&fd);
            debug!(fd, "Deregistered descriptor from reactor");
        }
    }
}

/// Poll one readiness direction of a registered descriptor, consuming the readiness
fn poll_readiness(
    registrations: &HashMap<RawFd, Registration>,
    fd: RawFd,
    interest: Interest,
    cx: &mut Context<'_>,
) -> bool {
    let Some(registration) = registrations.get(&fd) else {
        return false;
    };
    let ready = if interest.is_readable() {
        registration.async_fd.poll_read_ready(cx)
    } else {
        registration.async_fd.poll_write_ready(cx)
    };
    match ready {
        Poll::Ready(Ok(mut guard)) => {
            guard.clear_ready();
            true
        }
        Poll::Ready(Err(e)) => {
            warn!(fd, ?interest, "Readiness polling failed: {}", e);
            true
        }
        Poll::Pending => false,
    }
}

impl EventLoop for TokioEventLoop {
    fn watch_readable(&mut self, fd: RawFd) -> io::Result<WatchId> {
        self.register_fd(fd)?;
        Ok(self.allocate(WatchKind::Readable(fd), true))
    }

    fn watch_writable(&mut self, fd: RawFd, enabled: bool) -> io::Result<WatchId> {
        self.register_fd(fd)?;
        let id = self.allocate(WatchKind::Writable(fd), enabled);
        if enabled {
            self.kicked.push_back(id);
        }
        Ok(id)
    }

    fn set_enabled(&mut self, id: WatchId, enabled: bool) {
        let Some(watch) = self.watches.get_mut(&id) else {
            return;
        };
        let was_enabled = watch.enabled;
        watch.enabled = enabled;
        if enabled && !was_enabled && matches!(watch.kind, WatchKind::Writable(_)) {
            self.kicked.push_back(id);
        }
    }

    fn start_timer(&mut self, period: Duration) -> io::Result<WatchId> {
        if period.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer interval must be non-zero",
            ));
        }
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(self.allocate(WatchKind::Timer(interval), true))
    }

    fn unwatch(&mut self, id: WatchId) {
        let Some(watch) = self.watches.remove(&id) else {
            return;
        };
        self.kicked.retain(|kicked| *kicked != id);
        match watch.kind {
            WatchKind::Readable(fd) | WatchKind::Writable(fd) => self.release_fd(fd),
            WatchKind::Timer(_) => {}
        }
    }
}

/// Drive `client` until `shutdown` completes, returning its output
pub async fn run_until<E, F>(client: &mut MqttClient<E, TokioEventLoop>, shutdown: F) -> F::Output
where
    E: ProtocolEngine,
    F: Future,
{
    tokio::pin!(shutdown);
    loop {
        let event = tokio::select! {
            output = &mut shutdown => return output,
            event = client.event_loop_mut().next_event() => event,
        };
        client.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use tokio::time::timeout;

    fn socket_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    async fn next(event_loop: &mut TokioEventLoop) -> LoopEvent {
        timeout(Duration::from_secs(2), event_loop.next_event())
            .await
            .expect("event loop did not report an event")
    }

    #[tokio::test]
    async fn test_readable_watch_fires_on_data() {
        let (a, mut b) = socket_pair();
        let mut event_loop = TokioEventLoop::new();
        let read = event_loop.watch_readable(a.as_raw_fd()).unwrap();

        b.write_all(b"ping").unwrap();
        assert_eq!(next(&mut event_loop).await.id, read);
    }

    #[tokio::test]
    async fn test_enabled_writable_watch_is_kicked() {
        let (a, _b) = socket_pair();
        let mut event_loop = TokioEventLoop::new();
        let write = event_loop.watch_writable(a.as_raw_fd(), false).unwrap();

        event_loop.set_enabled(write, true);
        assert_eq!(next(&mut event_loop).await.id, write);
    }

    #[tokio::test]
    async fn test_disabled_watch_never_fires() {
        let (a, _b) = socket_pair();
        let mut event_loop = TokioEventLoop::new();
        event_loop.watch_writable(a.as_raw_fd(), false).unwrap();

        let result = timeout(Duration::from_millis(50), event_loop.next_event()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timer_fires_periodically() {
        let mut event_loop = TokioEventLoop::new();
        let timer = event_loop.start_timer(Duration::from_millis(10)).unwrap();

        assert_eq!(next(&mut event_loop).await.id, timer);
        assert_eq!(next(&mut event_loop).await.id, timer);
    }

    #[tokio::test]
    async fn test_one_registration_per_descriptor() {
        let (a, _b) = socket_pair();
        let mut event_loop = TokioEventLoop::new();
        let read = event_loop.watch_readable(a.as_raw_fd()).unwrap();
        let write = event_loop.watch_writable(a.as_raw_fd(), false).unwrap();
        assert_eq!(event_loop.registered_fds(), 1);
        assert_eq!(event_loop.len(), 2);

        event_loop.unwatch(read);
        assert_eq!(event_loop.registered_fds(), 1);
        event_loop.unwatch(write);
        event_loop.unwatch(write);
        assert_eq!(event_loop.registered_fds(), 0);
        assert!(event_loop.is_empty());
    }

    #[tokio::test]
    async fn test_zero_timer_is_rejected() {
        let mut event_loop = TokioEventLoop::new();
        assert!(event_loop.start_timer(Duration::ZERO).is_err());
    }
}
