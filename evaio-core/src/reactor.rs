//! Reactor interface consumed by the backend, and a small single-thread
//! implementation of it.
//!
//! The backend needs three things from the event loop it plugs into: a
//! persistent readable watch on the notification descriptor, a way to drop
//! that watch, and a way to schedule an operation's completion callback.
//!
//! The notification watch is internal to the backend. Reactors that can tell
//! internal watches apart refuse to drop them through the public
//! [`Reactor::unwatch`].

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::libc;
use parking_lot::Mutex;
use tracing::warn;

use crate::context::AioContext;
use crate::drain::DrainReport;
use crate::error::AioError;
use crate::kernel::Kernel;
use crate::op::OpHandle;
use crate::submit::SubmitReport;

/// Why an operation was activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An AIO completion is ready for dispatch.
    Aio,
}

/// Identifies a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub u64);

/// A scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Operation to dispatch.
    pub op: OpHandle,
    /// Activation reason.
    pub kind: EventKind,
}

/// Event loop services the backend relies on.
pub trait Reactor {
    /// Watch `fd` for readability until [`unwatch`](Self::unwatch).
    fn watch_readable(&self, fd: RawFd) -> io::Result<WatchToken>;

    /// Drop a watch.
    fn unwatch(&self, token: WatchToken);

    /// Watch `fd` for readability on behalf of the backend itself. Only
    /// [`unwatch_internal`](Self::unwatch_internal) removes it.
    fn watch_internal(&self, fd: RawFd) -> io::Result<WatchToken> {
        self.watch_readable(fd)
    }

    /// Drop a watch made by [`watch_internal`](Self::watch_internal).
    fn unwatch_internal(&self, token: WatchToken) {
        self.unwatch(token)
    }

    /// Schedule dispatch of `op`.
    fn activate(&self, op: OpHandle, kind: EventKind);
}

impl<T: Reactor + ?Sized> Reactor for Arc<T> {
    fn watch_readable(&self, fd: RawFd) -> io::Result<WatchToken> {
        (**self).watch_readable(fd)
    }

    fn unwatch(&self, token: WatchToken) {
        (**self).unwatch(token)
    }

    fn watch_internal(&self, fd: RawFd) -> io::Result<WatchToken> {
        (**self).watch_internal(fd)
    }

    fn unwatch_internal(&self, token: WatchToken) {
        (**self).unwatch_internal(token)
    }

    fn activate(&self, op: OpHandle, kind: EventKind) {
        (**self).activate(op, kind)
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    fd: RawFd,
    internal: bool,
}

struct LocalInner {
    watches: Mutex<HashMap<WatchToken, Watch>>,
    next_token: AtomicU64,
    activations_tx: Sender<Activation>,
    activations_rx: Receiver<Activation>,
}

/// `poll(2)`-based reactor with an activation queue.
///
/// Clones share state, so a test or a loop can keep one clone while the
/// context owns another.
#[derive(Clone)]
pub struct LocalReactor {
    inner: Arc<LocalInner>,
}

impl LocalReactor {
    /// Create an empty reactor.
    pub fn new() -> Self {
        let (activations_tx, activations_rx) = unbounded();
        Self {
            inner: Arc::new(LocalInner {
                watches: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                activations_tx,
                activations_rx,
            }),
        }
    }

    /// Number of registered watches.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.lock().len()
    }

    /// Whether `fd` is watched.
    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.inner.watches.lock().values().any(|w| w.fd == fd)
    }

    /// Wait up to `timeout` for watched descriptors to become readable.
    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<WatchToken>> {
        let watches: Vec<(WatchToken, RawFd)> = self
            .inner
            .watches
            .lock()
            .iter()
            .map(|(token, watch)| (*token, watch.fd))
            .collect();
        if watches.is_empty() {
            return Ok(Vec::new());
        }

        let mut fds: Vec<libc::pollfd> = watches
            .iter()
            .map(|&(_, fd)| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a valid array of `fds.len()` pollfd entries.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(Vec::new()),
                errno => Err(io::Error::from(errno)),
            };
        }

        Ok(fds
            .iter()
            .zip(&watches)
            .filter(|(pfd, _)| pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
            .map(|(_, &(token, _))| token)
            .collect())
    }

    /// Next scheduled callback, if any.
    pub fn try_next_activation(&self) -> Option<Activation> {
        self.inner.activations_rx.try_recv().ok()
    }

    /// Take every scheduled callback.
    pub fn drain_activations(&self) -> Vec<Activation> {
        self.inner.activations_rx.try_iter().collect()
    }

    /// Number of scheduled callbacks.
    pub fn pending_activations(&self) -> usize {
        self.inner.activations_rx.len()
    }
}

impl Default for LocalReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReactor")
            .field("watches", &self.watch_count())
            .field("pending_activations", &self.pending_activations())
            .finish()
    }
}

impl LocalReactor {
    fn register(&self, fd: RawFd, internal: bool) -> io::Result<WatchToken> {
        if fd < 0 {
            return Err(io::Error::from(Errno::EBADF));
        }
        let token = WatchToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner.watches.lock().insert(token, Watch { fd, internal });
        Ok(token)
    }
}

impl Reactor for LocalReactor {
    fn watch_readable(&self, fd: RawFd) -> io::Result<WatchToken> {
        self.register(fd, false)
    }

    fn unwatch(&self, token: WatchToken) {
        let mut watches = self.inner.watches.lock();
        match watches.get(&token).copied() {
            Some(watch) if watch.internal => {
                warn!(?token, fd = watch.fd, "refusing to drop internal watch");
            }
            Some(_) => {
                watches.remove(&token);
            }
            None => {}
        }
    }

    fn watch_internal(&self, fd: RawFd) -> io::Result<WatchToken> {
        self.register(fd, true)
    }

    fn unwatch_internal(&self, token: WatchToken) {
        self.inner.watches.lock().remove(&token);
    }

    fn activate(&self, op: OpHandle, kind: EventKind) {
        // Both channel ends live in `inner`, so the send cannot fail.
        let _ = self.inner.activations_tx.send(Activation { op, kind });
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    /// Submission pass.
    pub submit: SubmitReport,
    /// Drain, if the notification fired.
    pub drain: DrainReport,
    /// Callbacks run.
    pub dispatched: usize,
}

impl<K: Kernel> AioContext<K, LocalReactor> {
    /// One event loop iteration: submit, wait up to `timeout` for the
    /// notification, drain, then run every scheduled callback.
    pub fn run_once(&mut self, timeout: Duration) -> Result<TurnReport, AioError> {
        let mut report = TurnReport {
            submit: self.submit()?,
            ..TurnReport::default()
        };

        if let Some(token) = self.watch {
            let ready = self.reactor.poll(timeout).map_err(AioError::Poll)?;
            if ready.contains(&token) {
                report.drain = self.on_notify()?;
            }
        }

        while let Some(activation) = self.reactor.try_next_activation() {
            match self.dispatch(activation.op) {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(err) => warn!(op = %activation.op, %err, "dropping activation"),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventFd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_watch_and_unwatch() {
        let reactor = LocalReactor::new();
        let a = reactor.watch_readable(3).unwrap();
        let b = reactor.watch_readable(4).unwrap();
        assert_ne!(a, b);
        assert!(reactor.is_watching(3));
        reactor.unwatch(a);
        assert!(!reactor.is_watching(3));
        assert_eq!(reactor.watch_count(), 1);
        assert!(reactor.watch_readable(-1).is_err());
    }

    #[test]
    fn test_internal_watch_survives_unwatch() {
        let reactor = LocalReactor::new();
        let token = reactor.watch_internal(5).unwrap();
        reactor.unwatch(token);
        assert!(reactor.is_watching(5));

        reactor.unwatch_internal(token);
        assert!(!reactor.is_watching(5));
        assert_eq!(reactor.watch_count(), 0);
    }

    #[test]
    fn test_activation_queue_is_fifo() {
        let reactor = LocalReactor::new();
        reactor.activate(OpHandle::new(1, 1), EventKind::Aio);
        reactor.activate(OpHandle::new(2, 1), EventKind::Aio);
        assert_eq!(reactor.pending_activations(), 2);
        assert_eq!(reactor.try_next_activation().unwrap().op, OpHandle::new(1, 1));
        let rest = reactor.drain_activations();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].op, OpHandle::new(2, 1));
        assert!(reactor.try_next_activation().is_none());
    }

    #[test]
    fn test_poll_reports_readable() {
        let reactor = LocalReactor::new();
        let efd = EventFd::new().unwrap();
        let token = reactor.watch_readable(efd.as_raw_fd()).unwrap();

        assert!(reactor.poll(Duration::ZERO).unwrap().is_empty());
        efd.signal(1).unwrap();
        assert_eq!(reactor.poll(Duration::from_millis(100)).unwrap(), vec![token]);
    }

    #[test]
    fn test_poll_without_watches() {
        let reactor = LocalReactor::new();
        assert!(reactor.poll(Duration::from_secs(10)).unwrap().is_empty());
    }
}
