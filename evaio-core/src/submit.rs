//! # Submission Pipeline
//!
//! Moves queued operations to the kernel in batches of at most
//! `N - in_flight`:
//!
//! ```text
//!   read lock          unlocked              write lock
//! ┌────────────┐   ┌────────────────┐   ┌──────────────────────┐
//! │ snapshot   │──►│ kernel.submit  │──►│ Queued -> Submitted  │──► repeat
//! │ FIFO batch │   │ (whole batch)  │   │ (accepted prefix)    │
//! └────────────┘   └────────────────┘   └──────────────────────┘
//!                          │ EAGAIN / 0: stop, batch stays Queued
//!                          │ other errno: batch completes with the error
//! ```
//!
//! Producers may enqueue while the kernel call runs; their operations land
//! behind the snapshot and go out on a later pass.

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use crate::context::AioContext;
use crate::error::AioError;
use crate::kernel::Kernel;
use crate::reactor::{EventKind, Reactor};

/// Outcome of one [`AioContext::submit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Kernel submission calls made.
    pub batches: usize,
    /// Operations the kernel accepted.
    pub submitted: usize,
    /// Operations still queued when the pass stopped on backpressure or a
    /// full in-flight window.
    pub deferred: usize,
    /// Operations completed with a submission error.
    pub failed: usize,
}

impl<K: Kernel, R: Reactor> AioContext<K, R> {
    /// Push queued operations to the kernel until the queue is empty, the
    /// in-flight window is full, or the kernel pushes back.
    ///
    /// Backpressure is not an error: the operations stay queued and the next
    /// call retries them in order. A hard kernel error completes every
    /// member of the failing batch with that errno and activates it.
    pub fn submit(&mut self) -> Result<SubmitReport, AioError> {
        let mut report = SubmitReport::default();

        loop {
            let batch = self.snapshot_batch();
            if batch == 0 {
                break;
            }

            self.arm()?;
            report.batches += 1;

            // SAFETY: each pointer is the boxed control block of a Queued
            // record in the arena. Records leave the arena only through
            // `release`, which refuses non-terminal records, and the kernel
            // context is dropped before the table.
            let outcome = unsafe { self.kernel.submit(&self.scratch.iocbs[..batch]) };

            match outcome {
                Ok(0) | Err(Errno::EAGAIN) => {
                    debug!(batch, in_flight = self.in_flight, "kernel pushed back, deferring");
                    self.stats.deferred.inc();
                    break;
                }
                Ok(accepted) => {
                    let accepted = accepted.min(batch);
                    self.finalize_submitted(accepted);
                    report.submitted += accepted;
                    if accepted < batch {
                        trace!(accepted, batch, "partial submission");
                    }
                }
                Err(errno) => {
                    report.failed += self.fail_batch(batch, errno);
                    break;
                }
            }
        }

        self.scratch.clear();
        report.deferred = self.pending_len();
        Ok(report)
    }

    /// Copy the queue head into the scratch arrays. Returns the batch size.
    fn snapshot_batch(&mut self) -> usize {
        self.scratch.clear();
        let room = self.capacity.saturating_sub(self.in_flight);
        if room == 0 {
            return 0;
        }

        let table = self.table.read();
        for &handle in table.pending.iter().take(room) {
            if let Some(op) = table.ops.get(handle) {
                self.scratch.iocbs.push(op.iocb_ptr());
                self.scratch.handles.push(handle);
            }
        }
        self.scratch.handles.len()
    }

    fn finalize_submitted(&mut self, accepted: usize) {
        let mut table = self.table.write();
        for &handle in &self.scratch.handles[..accepted] {
            let moved = table.mark_submitted(handle);
            debug_assert!(moved, "{handle} left Queued during submission");
        }
        drop(table);

        self.in_flight += accepted;
        debug_assert!(self.in_flight <= self.capacity);
        self.stats.submitted.add(accepted as u64);
    }

    /// Complete every batch member with `errno`, off the queue, and activate
    /// them. Returns how many were failed.
    fn fail_batch(&mut self, batch: usize, errno: Errno) -> usize {
        warn!(%errno, batch, "kernel rejected submission batch");

        self.scratch.handles.truncate(batch);
        let mut table = self.table.write();
        self.scratch
            .handles
            .retain(|&handle| table.fail_queued(handle, errno));
        drop(table);

        let failed = self.scratch.handles.len();
        self.stats.failed_submissions.add(failed as u64);
        for &handle in &self.scratch.handles {
            self.reactor.activate(handle, EventKind::Aio);
        }
        failed
    }
}
