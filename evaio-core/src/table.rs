//! The shared operation table: arena plus pending queue behind one lock.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::RwLock;
use tracing::trace;

use crate::arena::OpArena;
use crate::error::AioError;
use crate::op::{AioOp, OpHandle, OpState};
use crate::queue::PendingQueue;
use crate::stats::AioStats;

/// Table shared between the reactor thread and submitters.
pub(crate) type SharedTable = Arc<RwLock<OpTable>>;

#[derive(Debug, Default)]
pub(crate) struct OpTable {
    pub(crate) ops: OpArena,
    pub(crate) pending: PendingQueue,
}

impl OpTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: OpArena::with_capacity(capacity),
            pending: PendingQueue::new(),
        }
    }

    /// Take ownership of a prepared record and append it to the queue.
    pub(crate) fn enqueue(&mut self, mut op: AioOp, resfd: RawFd) -> Result<OpHandle, AioError> {
        if op.state() != OpState::Prepared {
            return Err(AioError::NotPrepared(op.state()));
        }

        let handle = self.ops.insert_with(|handle| {
            op.bind(handle, resfd);
            op.set_queued();
            op
        });
        self.pending.push_back(handle);
        Ok(handle)
    }

    pub(crate) fn state(&self, handle: OpHandle) -> Option<OpState> {
        self.ops.get(handle).map(AioOp::state)
    }

    /// `Queued -> Submitted`, leaving the queue.
    pub(crate) fn mark_submitted(&mut self, handle: OpHandle) -> bool {
        match self.ops.get_mut(handle) {
            Some(op) if op.state() == OpState::Queued => {
                op.set_submitted();
                self.pending.remove(handle);
                true
            }
            _ => false,
        }
    }

    /// `Queued -> Completed` with a submission error, leaving the queue.
    pub(crate) fn fail_queued(&mut self, handle: OpHandle, errno: Errno) -> bool {
        match self.ops.get_mut(handle) {
            Some(op) => {
                let failed = op.fail_submission(errno);
                if failed {
                    self.pending.remove(handle);
                }
                failed
            }
            None => false,
        }
    }

    /// `Queued -> Cancelled`, leaving the queue.
    pub(crate) fn cancel_queued(&mut self, handle: OpHandle) -> bool {
        match self.ops.get_mut(handle) {
            Some(op) if op.state() == OpState::Queued => {
                op.set_cancelled();
                self.pending.remove(handle);
                true
            }
            _ => false,
        }
    }

    /// Hand a finished record back to its owner. A `Completed` record is
    /// only released once its callback has been dispatched.
    pub(crate) fn release(&mut self, handle: OpHandle) -> Result<AioOp, AioError> {
        let op = self.ops.get(handle).ok_or(AioError::StaleHandle(handle))?;
        if !op.is_releasable() {
            return Err(AioError::InvalidState {
                handle,
                state: op.state(),
                expected: "Cancelled, or Completed and dispatched",
            });
        }
        self.ops.remove(handle).ok_or(AioError::StaleHandle(handle))
    }

    /// Queue membership must match the `Queued` state exactly.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        for handle in self.pending.iter() {
            match self.state(*handle) {
                Some(OpState::Queued) => {}
                other => return Err(format!("{handle} is in the pending queue in state {other:?}")),
            }
        }

        let queued = self
            .ops
            .iter()
            .filter(|(_, op)| op.state() == OpState::Queued)
            .count();
        if queued != self.pending.len() {
            return Err(format!(
                "{queued} operations are Queued but the pending queue holds {}",
                self.pending.len()
            ));
        }
        Ok(())
    }

    pub(crate) fn count_in(&self, state: OpState) -> usize {
        self.ops.iter().filter(|(_, op)| op.state() == state).count()
    }
}

/// Cloneable handle for enqueueing operations from any thread.
///
/// Enqueued operations wait in the pending queue until the owning context's
/// next `submit` pass.
#[derive(Clone)]
pub struct AioSubmitter {
    pub(crate) table: SharedTable,
    pub(crate) resfd: RawFd,
    pub(crate) stats: Arc<AioStats>,
}

impl AioSubmitter {
    /// Enqueue a prepared operation.
    pub fn enqueue(&self, op: AioOp) -> Result<OpHandle, AioError> {
        let handle = self.table.write().enqueue(op, self.resfd)?;
        self.stats.enqueued.inc();
        trace!(%handle, "operation enqueued");
        Ok(handle)
    }

    /// Number of operations waiting for submission.
    pub fn pending_len(&self) -> usize {
        self.table.read().pending.len()
    }
}

impl std::fmt::Debug for AioSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioSubmitter")
            .field("resfd", &self.resfd)
            .finish_non_exhaustive()
    }
}
