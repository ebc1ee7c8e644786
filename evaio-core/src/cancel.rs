//! # Cancellation Path

use nix::errno::Errno;
use tracing::{debug, info};

use crate::context::AioContext;
use crate::error::AioError;
use crate::kernel::Kernel;
use crate::op::{OpHandle, OpState};
use crate::reactor::Reactor;

/// What a cancel request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Taken off the pending queue before submission. State `Cancelled`; no
    /// callback will run.
    Dequeued,
    /// The kernel cancelled the request. State `Completed`, activated.
    Cancelled,
    /// The kernel refused. The operation stays `Submitted` and its natural
    /// completion arrives through the drain loop.
    InFlight(Errno),
    /// Already `Completed` or `Cancelled`. Nothing changed.
    AlreadyFinished,
}

impl<K: Kernel, R: Reactor> AioContext<K, R> {
    /// Cancel an operation in whatever stage it is.
    pub fn cancel(&mut self, handle: OpHandle) -> Result<CancelOutcome, AioError> {
        let (state, iocb) = {
            let table = self.table.read();
            let op = table.ops.get(handle).ok_or(AioError::StaleHandle(handle))?;
            (op.state(), op.iocb_ptr())
        };

        match state {
            OpState::Queued => {
                if !self.table.write().cancel_queued(handle) {
                    return Ok(CancelOutcome::AlreadyFinished);
                }
                self.stats.cancelled_queued.inc();
                debug!(%handle, "queued operation cancelled");
                Ok(CancelOutcome::Dequeued)
            }
            OpState::Submitted => {
                let record = &mut self.scratch.events[0];
                // SAFETY: `iocb` belongs to a Submitted record, so the kernel
                // accepted it and it is still in the arena.
                let outcome = unsafe { self.kernel.cancel(iocb, record) };
                match outcome {
                    Ok(()) => {
                        let record = self.scratch.events[0];
                        if self.resolve_one(handle, &record) {
                            self.stats.cancelled_submitted.inc();
                            debug!(%handle, res = record.res, "submitted operation cancelled");
                            Ok(CancelOutcome::Cancelled)
                        } else {
                            Ok(CancelOutcome::AlreadyFinished)
                        }
                    }
                    Err(errno) => {
                        self.stats.cancel_rejected.inc();
                        info!(%handle, %errno, "kernel declined cancel, awaiting completion");
                        Ok(CancelOutcome::InFlight(errno))
                    }
                }
            }
            OpState::Completed | OpState::Cancelled => Ok(CancelOutcome::AlreadyFinished),
            OpState::Idle | OpState::Prepared => Err(AioError::InvalidState {
                handle,
                state,
                expected: "Queued or Submitted",
            }),
        }
    }
}
