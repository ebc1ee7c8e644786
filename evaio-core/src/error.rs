//! Backend errors.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::config::ConfigError;
use crate::op::{OpHandle, OpState};

/// Errors reported by the AIO backend.
///
/// Kernel backpressure is not an error (see `SubmitReport`), and a kernel
/// refusal to accept or cancel a request is delivered per operation.
#[derive(Debug, Error)]
pub enum AioError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The notification eventfd could not be created.
    #[error("failed to create notification eventfd: {0}")]
    Notify(#[source] io::Error),

    /// The kernel refused to create a completion context.
    #[error("failed to set up kernel AIO context: {0}")]
    KernelSetup(#[source] io::Error),

    /// The reactor refused to watch the notification descriptor.
    #[error("failed to watch notification descriptor: {0}")]
    Watch(#[source] io::Error),

    /// Reading the notification counter failed.
    #[error("failed to read notification counter: {0}")]
    NotifyRead(#[source] io::Error),

    /// Waiting for readiness failed.
    #[error("failed to poll reactor: {0}")]
    Poll(#[source] io::Error),

    /// The handle does not name a live operation.
    #[error("stale or unknown operation handle {0}")]
    StaleHandle(OpHandle),

    /// The operation is in the wrong state for the request.
    #[error("{handle} is {state:?}, expected {expected}")]
    InvalidState {
        /// The operation.
        handle: OpHandle,
        /// Its current state.
        state: OpState,
        /// States the request accepts.
        expected: &'static str,
    },

    /// Only `Prepared` operations can be enqueued.
    #[error("operation must be prepared before enqueue (state {0:?})")]
    NotPrepared(OpState),

    /// Requested length does not fit the buffer.
    #[error("length {length} exceeds buffer capacity {capacity}")]
    BufferTooSmall {
        /// Requested length.
        length: usize,
        /// Buffer length.
        capacity: usize,
    },

    /// Negative descriptor.
    #[error("invalid file descriptor {0}")]
    InvalidDescriptor(RawFd),

    /// Negative offset.
    #[error("invalid file offset {0}")]
    InvalidOffset(i64),
}
