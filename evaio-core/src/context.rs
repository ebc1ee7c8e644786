//! # AIO Context
//!
//! One per event loop. Owns the kernel completion context, the notification
//! eventfd, the reactor watch on it, and the scratch arrays every submission
//! and drain pass reuses.
//!
//! The context itself stays on the reactor thread (`&mut self` for submit,
//! drain and cancel). Other threads enqueue through [`AioSubmitter`] clones,
//! which share the operation table behind a `parking_lot::RwLock`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::abi::{IoEvent, Iocb};
use crate::config::AioConfig;
use crate::error::AioError;
use crate::kernel::{Kernel, LinuxAio};
use crate::notify::EventFd;
use crate::op::{AioOp, OpHandle, OpState};
use crate::reactor::{Reactor, WatchToken};
use crate::stats::{AioStats, StatsSnapshot};
use crate::table::{AioSubmitter, OpTable, SharedTable};

/// Fixed-size per-pass working storage.
///
/// Holds nothing between calls: each pass clears it before use.
pub(crate) struct Scratch {
    pub(crate) iocbs: Vec<*mut Iocb>,
    pub(crate) handles: Vec<OpHandle>,
    pub(crate) events: Box<[IoEvent]>,
}

// SAFETY: the control-block pointers are only handed to the kernel during the
// pass that collected them and never dereferenced by this crate.
unsafe impl Send for Scratch {}

impl Scratch {
    fn new(capacity: usize) -> Self {
        Self {
            iocbs: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
            events: vec![IoEvent::default(); capacity].into_boxed_slice(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.iocbs.clear();
        self.handles.clear();
    }
}

/// Kernel AIO backend for one event loop.
pub struct AioContext<K: Kernel, R: Reactor> {
    // Field order is drop order: the kernel context is torn down (waiting for
    // in-flight requests) before the eventfd closes and the table goes away.
    pub(crate) kernel: K,
    pub(crate) notify: EventFd,
    pub(crate) reactor: R,
    pub(crate) watch: Option<WatchToken>,
    pub(crate) capacity: usize,
    pub(crate) in_flight: usize,
    pub(crate) table: SharedTable,
    pub(crate) scratch: Scratch,
    pub(crate) stats: Arc<AioStats>,
}

impl<R: Reactor> AioContext<LinuxAio, R> {
    /// Create a context backed by Linux native AIO.
    pub fn new(config: &AioConfig, reactor: R) -> Result<Self, AioError> {
        Self::with_kernel(config, reactor, LinuxAio::setup)
    }
}

impl<K: Kernel, R: Reactor> AioContext<K, R> {
    /// Create a context over any [`Kernel`]. `setup` receives the capacity.
    ///
    /// Nothing is watched until the first non-empty submission batch.
    pub fn with_kernel<F>(config: &AioConfig, reactor: R, setup: F) -> Result<Self, AioError>
    where
        F: FnOnce(usize) -> io::Result<K>,
    {
        config.validate()?;
        let capacity = config.capacity;

        let notify = EventFd::new().map_err(AioError::Notify)?;
        let kernel = setup(capacity).map_err(AioError::KernelSetup)?;

        info!(
            backend = K::NAME,
            capacity,
            notify_fd = notify.as_raw_fd(),
            "AIO context created"
        );

        Ok(Self {
            kernel,
            notify,
            reactor,
            watch: None,
            capacity,
            in_flight: 0,
            table: Arc::new(RwLock::new(OpTable::with_capacity(capacity))),
            scratch: Scratch::new(capacity),
            stats: Arc::new(AioStats::default()),
        })
    }

    /// A handle other threads can enqueue through.
    pub fn submitter(&self) -> AioSubmitter {
        AioSubmitter {
            table: Arc::clone(&self.table),
            resfd: self.notify.as_raw_fd(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Enqueue a prepared operation. It reaches the kernel on the next
    /// [`submit`](Self::submit).
    pub fn enqueue(&self, op: AioOp) -> Result<OpHandle, AioError> {
        let handle = self
            .table
            .write()
            .enqueue(op, self.notify.as_raw_fd())?;
        self.stats.enqueued.inc();
        trace!(%handle, "operation enqueued");
        Ok(handle)
    }

    /// Run the completion callback of a `Completed` operation.
    ///
    /// Returns `Ok(false)` if it already ran. The callback runs without the
    /// table lock held.
    pub fn dispatch(&self, handle: OpHandle) -> Result<bool, AioError> {
        let dispatch = {
            let mut table = self.table.write();
            let op = table
                .ops
                .get_mut(handle)
                .ok_or(AioError::StaleHandle(handle))?;
            if op.state() != OpState::Completed {
                return Err(AioError::InvalidState {
                    handle,
                    state: op.state(),
                    expected: "Completed",
                });
            }
            op.begin_dispatch()
        };

        let Some(mut dispatch) = dispatch else {
            return Ok(false);
        };

        if let Some(mut callback) = dispatch.callback.take() {
            callback(&dispatch.completion(handle));
            dispatch.callback = Some(callback);
        }

        if let Some(op) = self.table.write().ops.get_mut(handle) {
            op.end_dispatch(dispatch);
        }
        self.stats.dispatched.inc();
        Ok(true)
    }

    /// Take back a `Cancelled` operation, or a `Completed` one whose
    /// callback has been dispatched. The handle becomes stale.
    pub fn release(&self, handle: OpHandle) -> Result<AioOp, AioError> {
        self.table.write().release(handle)
    }

    /// Current state of an operation, `None` for a stale handle.
    pub fn state(&self, handle: OpHandle) -> Option<OpState> {
        self.table.read().state(handle)
    }

    /// `(result, error)` of a `Completed` operation.
    pub fn result(&self, handle: OpHandle) -> Option<(i64, i32)> {
        let table = self.table.read();
        let op = table.ops.get(handle)?;
        (op.state() == OpState::Completed).then(|| (op.result(), op.error()))
    }

    /// Operations waiting in the pending queue.
    pub fn pending_len(&self) -> usize {
        self.table.read().pending.len()
    }

    /// Operations held by the context, in any state, not yet released.
    pub fn live_operations(&self) -> usize {
        self.table.read().ops.len()
    }

    /// Operations the kernel currently holds.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Capacity `N`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The eventfd the kernel signals.
    pub fn notify_fd(&self) -> RawFd {
        self.notify.as_raw_fd()
    }

    /// Whether the notification watch is registered.
    pub fn is_armed(&self) -> bool {
        self.watch.is_some()
    }

    /// Counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The kernel backend.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The kernel backend, mutably.
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// The reactor this context activates through.
    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    /// Panic if the table or the in-flight count are inconsistent.
    ///
    /// Checks that the pending queue holds exactly the `Queued` operations,
    /// that the in-flight count matches the `Submitted` operations, and that
    /// it never exceeds the capacity.
    pub fn assert_invariants(&self) {
        let table = self.table.read();
        if let Err(violation) = table.check_invariants() {
            panic!("operation table inconsistent: {violation}");
        }
        let submitted = table.count_in(OpState::Submitted);
        assert_eq!(
            submitted, self.in_flight,
            "in-flight count disagrees with Submitted operations"
        );
        assert!(
            self.in_flight <= self.capacity,
            "{} operations in flight with capacity {}",
            self.in_flight,
            self.capacity
        );
    }

    /// Register the notification watch if it is not already.
    pub(crate) fn arm(&mut self) -> Result<(), AioError> {
        if self.watch.is_some() {
            return Ok(());
        }
        let fd = self.notify.as_raw_fd();
        let token = self.reactor.watch_internal(fd).map_err(AioError::Watch)?;
        debug!(fd, ?token, "notification watch armed");
        self.watch = Some(token);
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(token) = self.watch.take() {
            self.reactor.unwatch_internal(token);
            debug!(?token, "notification watch removed");
        }
    }

    /// Tear the context down. Dropping it does the same.
    pub fn destroy(mut self) {
        self.disarm();
    }
}

impl<K: Kernel, R: Reactor> Drop for AioContext<K, R> {
    fn drop(&mut self) {
        self.disarm();
        debug!(
            backend = K::NAME,
            in_flight = self.in_flight,
            "AIO context destroyed"
        );
    }
}

impl<K: Kernel, R: Reactor> std::fmt::Debug for AioContext<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioContext")
            .field("backend", &K::NAME)
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight)
            .field("notify_fd", &self.notify.as_raw_fd())
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::LocalReactor;
    use crate::sim::SimKernel;

    fn context(capacity: usize) -> (AioContext<SimKernel, LocalReactor>, LocalReactor) {
        let reactor = LocalReactor::new();
        let config = AioConfig::builder().capacity(capacity).build().unwrap();
        let ctx = AioContext::with_kernel(&config, reactor.clone(), SimKernel::setup).unwrap();
        (ctx, reactor)
    }

    fn read_op() -> AioOp {
        let mut op = AioOp::without_callback();
        op.prepare_read(0, vec![0; 16], 16, 0, 0).unwrap();
        op
    }

    #[test]
    fn test_create_does_not_arm() {
        let (ctx, reactor) = context(4);
        assert!(!ctx.is_armed());
        assert_eq!(reactor.watch_count(), 0);
        assert_eq!(ctx.capacity(), 4);
        assert!(ctx.notify_fd() >= 0);
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let config = AioConfig::default();
        let err = AioContext::<SimKernel, _>::with_kernel(&config, LocalReactor::new(), |_| {
            Err(io::Error::from_raw_os_error(nix::libc::ENOSYS))
        })
        .unwrap_err();
        assert!(matches!(err, AioError::KernelSetup(_)));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let config = AioConfig {
            capacity: 0,
            ..AioConfig::default()
        };
        let err = AioContext::with_kernel(&config, LocalReactor::new(), SimKernel::setup)
            .unwrap_err();
        assert!(matches!(err, AioError::Config(_)));
    }

    #[test]
    fn test_enqueue_binds_notify_fd() {
        let (mut ctx, _reactor) = context(4);
        let handle = ctx.enqueue(read_op()).unwrap();
        assert_eq!(ctx.state(handle), Some(OpState::Queued));
        assert_eq!(ctx.pending_len(), 1);

        ctx.submit().unwrap();
        let request = ctx.kernel().in_flight_requests().next().copied().unwrap();
        assert_eq!(request.data, handle.to_user_data());
        assert_eq!(request.resfd, Some(ctx.notify_fd()));
    }

    #[test]
    fn test_destroy_unwatches_once() {
        let (mut ctx, reactor) = context(4);
        ctx.enqueue(read_op()).unwrap();
        ctx.submit().unwrap();
        assert!(ctx.is_armed());
        assert_eq!(reactor.watch_count(), 1);

        ctx.destroy();
        assert_eq!(reactor.watch_count(), 0);
    }

    #[test]
    fn test_drop_never_armed() {
        let (ctx, reactor) = context(4);
        drop(ctx);
        assert_eq!(reactor.watch_count(), 0);
    }

    #[test]
    fn test_dispatch_requires_completed() {
        let (ctx, _reactor) = context(4);
        let handle = ctx.enqueue(read_op()).unwrap();
        assert!(matches!(
            ctx.dispatch(handle),
            Err(AioError::InvalidState {
                state: OpState::Queued,
                ..
            })
        ));
    }

    #[test]
    fn test_submitter_enqueues_from_other_thread() {
        let (ctx, _reactor) = context(4);
        let submitter = ctx.submitter();
        let handle = std::thread::spawn(move || submitter.enqueue(read_op()).unwrap())
            .join()
            .unwrap();
        assert_eq!(ctx.state(handle), Some(OpState::Queued));
        assert_eq!(ctx.stats().enqueued, 1);
        ctx.assert_invariants();
    }
}
