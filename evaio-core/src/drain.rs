//! # Completion Drain Loop
//!
//! Runs when the notification eventfd becomes readable. The counter value is
//! a hint: the loop asks the kernel for at least that many records (capped
//! at `N`) without waiting, and goes around again only while it keeps
//! getting full batches.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::abi::IoEvent;
use crate::context::AioContext;
use crate::error::AioError;
use crate::kernel::Kernel;
use crate::op::OpHandle;
use crate::reactor::{EventKind, Reactor};

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// `get_events` calls made.
    pub passes: usize,
    /// Completion records retrieved.
    pub retrieved: usize,
    /// Operations resolved and activated.
    pub resolved: usize,
    /// Records that named no live `Submitted` operation.
    pub stale: usize,
}

impl<K: Kernel, R: Reactor> AioContext<K, R> {
    /// Readiness handler for the notification watch.
    ///
    /// A spurious wakeup reads a zero counter and still drains whatever the
    /// kernel has ready.
    pub fn on_notify(&mut self) -> Result<DrainReport, AioError> {
        let hint = self.notify.read_count().map_err(AioError::NotifyRead)?;
        trace!(hint, "notification counter read");
        Ok(self.process(hint))
    }

    /// Collect and resolve completion records, `hint` being how many the
    /// kernel signalled.
    pub fn process(&mut self, hint: u64) -> DrainReport {
        let capacity = self.capacity;
        let mut remaining = hint;
        let mut report = DrainReport::default();

        loop {
            let min_nr = remaining.min(capacity as u64) as usize;
            let retrieved =
                match self
                    .kernel
                    .get_events(min_nr, &mut self.scratch.events[..], Duration::ZERO)
                {
                    Ok(n) => n.min(capacity),
                    Err(errno) => {
                        warn!(%errno, "failed to retrieve completions");
                        break;
                    }
                };

            report.passes += 1;
            self.stats.drain_passes.inc();
            report.retrieved += retrieved;
            self.resolve_events(retrieved, &mut report);

            remaining = remaining.saturating_sub(retrieved as u64);
            // Only a full batch can leave more behind.
            if retrieved < capacity {
                break;
            }
        }

        if report.retrieved > 0 {
            debug!(
                hint,
                retrieved = report.retrieved,
                resolved = report.resolved,
                in_flight = self.in_flight,
                "completions drained"
            );
        }
        report
    }

    fn resolve_events(&mut self, count: usize, report: &mut DrainReport) {
        if count == 0 {
            return;
        }

        self.scratch.handles.clear();
        let mut errors = 0u64;
        let mut table = self.table.write();
        for event in &self.scratch.events[..count] {
            let handle = OpHandle::from_user_data(event.data);
            match table.ops.get_mut(handle) {
                Some(op) => {
                    if op.complete_from(event) {
                        if op.error() != 0 {
                            errors += 1;
                        }
                        self.scratch.handles.push(handle);
                    } else {
                        debug!(%handle, state = ?op.state(), "ignoring completion for resolved operation");
                        report.stale += 1;
                    }
                }
                None => {
                    warn!(%handle, res = event.res, "completion for unknown operation");
                    report.stale += 1;
                }
            }
        }
        drop(table);

        let resolved = self.scratch.handles.len();
        self.in_flight = self.in_flight.saturating_sub(resolved);
        report.resolved += resolved;
        self.stats.completed.add(resolved as u64);
        self.stats.completion_errors.add(errors);
        self.stats.stale_completions.add((count - resolved) as u64);

        for &handle in &self.scratch.handles {
            self.reactor.activate(handle, EventKind::Aio);
        }
        self.scratch.handles.clear();
    }

    /// Resolve one operation from a record obtained outside the drain loop.
    /// Returns `false` if it was not `Submitted`.
    pub(crate) fn resolve_one(&mut self, handle: OpHandle, event: &IoEvent) -> bool {
        let resolved = {
            let mut table = self.table.write();
            match table.ops.get_mut(handle) {
                Some(op) => op.complete_from(event),
                None => false,
            }
        };
        if resolved {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.stats.completed.inc();
            self.reactor.activate(handle, EventKind::Aio);
        }
        resolved
    }
}
