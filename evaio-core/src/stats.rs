//! Backend counters.
//!
//! Lock-free and monotonic. Producers on other threads bump `enqueued`; the
//! reactor thread bumps everything else.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add a value.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
}

/// Counters for one AIO context.
#[derive(Debug, Default)]
pub struct AioStats {
    /// Operations placed in the pending queue.
    pub enqueued: Counter,
    /// Operations accepted by the kernel.
    pub submitted: Counter,
    /// Submission passes stopped by kernel backpressure.
    pub deferred: Counter,
    /// Operations completed synthetically after a hard submission failure.
    pub failed_submissions: Counter,
    /// Operations resolved from a kernel completion record.
    pub completed: Counter,
    /// Kernel completions that carried an error.
    pub completion_errors: Counter,
    /// Queued operations cancelled before submission.
    pub cancelled_queued: Counter,
    /// Submitted operations cancelled by the kernel.
    pub cancelled_submitted: Counter,
    /// Cancel requests the kernel rejected.
    pub cancel_rejected: Counter,
    /// `get_events` calls made by the drain loop.
    pub drain_passes: Counter,
    /// Completion records that resolved to no live `Submitted` operation.
    pub stale_completions: Counter,
    /// Callbacks run.
    pub dispatched: Counter,
}

impl AioStats {
    /// Copy out the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.get(),
            submitted: self.submitted.get(),
            deferred: self.deferred.get(),
            failed_submissions: self.failed_submissions.get(),
            completed: self.completed.get(),
            completion_errors: self.completion_errors.get(),
            cancelled_queued: self.cancelled_queued.get(),
            cancelled_submitted: self.cancelled_submitted.get(),
            cancel_rejected: self.cancel_rejected.get(),
            drain_passes: self.drain_passes.get(),
            stale_completions: self.stale_completions.get(),
            dispatched: self.dispatched.get(),
        }
    }
}

/// Point-in-time copy of [`AioStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub submitted: u64,
    pub deferred: u64,
    pub failed_submissions: u64,
    pub completed: u64,
    pub completion_errors: u64,
    pub cancelled_queued: u64,
    pub cancelled_submitted: u64,
    pub cancel_rejected: u64,
    pub drain_passes: u64,
    pub stale_completions: u64,
    pub dispatched: u64,
}
