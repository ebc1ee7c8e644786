//! # Operation Records
//!
//! An [`AioOp`] carries one read or write request from preparation to its
//! terminal state.
//!
//! ## Lifecycle
//!
//! ```text
//!  caller-owned                 arena-owned (addressed by OpHandle)
//! ┌──────┐ prepare ┌──────────┐ enqueue ┌────────┐ submit ┌───────────┐ drain/cancel ┌───────────┐
//! │ Idle │────────►│ Prepared │────────►│ Queued │───────►│ Submitted │─────────────►│ Completed │
//! └──────┘         └──────────┘         └────────┘        └───────────┘              └───────────┘
//!                                          │  │ hard submit failure                        ▲
//!                                          │  └────────────────────────────────────────────┘
//!                                          │ cancel
//!                                          ▼
//!                                     ┌───────────┐
//!                                     │ Cancelled │
//!                                     └───────────┘
//! ```
//!
//! The caller owns the record until `enqueue`, and gets it back with
//! `release` once it is `Completed` or `Cancelled`. The buffer and the kernel
//! control block are heap allocations whose addresses do not change while the
//! record sits in the arena.

use std::cell::UnsafeCell;
use std::fmt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::abi::{IoEvent, Iocb, IOCB_CMD_PREAD, IOCB_CMD_PWRITE, IOCB_FLAG_RESFD};
use crate::arena::Generation;
use crate::error::AioError;

/// Direction of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Positional read into the buffer.
    Read,
    /// Positional write from the buffer.
    Write,
}

impl OpKind {
    fn opcode(self) -> u16 {
        match self {
            OpKind::Read => IOCB_CMD_PREAD,
            OpKind::Write => IOCB_CMD_PWRITE,
        }
    }
}

/// Lifecycle state of an [`AioOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Created, no request attached yet.
    Idle,
    /// Request fields filled in; not yet enqueued.
    Prepared,
    /// Waiting in the pending queue.
    Queued,
    /// Accepted by the kernel.
    Submitted,
    /// Result is available. Terminal.
    Completed,
    /// Removed from the pending queue before submission. Terminal.
    Cancelled,
}

impl OpState {
    /// Returns `true` for `Completed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Completed | OpState::Cancelled)
    }
}

/// Stable reference to an operation held by a backend.
///
/// Packs into the kernel's 64-bit `aio_data` so a completion record resolves
/// to its operation in O(1). The generation makes a handle to a released
/// record (or a late completion carrying one) resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle {
    index: u32,
    generation: Generation,
}

impl OpHandle {
    pub(crate) const fn new(index: u32, generation: Generation) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the handle was issued.
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Encode as kernel `aio_data`.
    pub const fn to_user_data(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Decode from kernel `aio_data`.
    pub const fn from_user_data(data: u64) -> Self {
        Self {
            index: data as u32,
            generation: (data >> 32) as Generation,
        }
    }
}

impl fmt::Display for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}.{}", self.index, self.generation)
    }
}

/// What a completion callback sees.
///
/// `result` is the byte count, `-1` after a kernel-reported failure, or `0`
/// for a request the kernel refused at submission. `error` is the positive
/// errno, `0` on success.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    /// The completed operation.
    pub op: OpHandle,
    /// Read or write.
    pub kind: OpKind,
    /// The whole operation buffer.
    pub buffer: &'a [u8],
    /// Requested length.
    pub length: usize,
    /// Requested file offset.
    pub offset: i64,
    /// Bytes transferred, `-1` on error.
    pub result: i64,
    /// Positive errno, `0` on success.
    pub error: i32,
}

impl Completion<'_> {
    /// Returns `true` if no error was reported.
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    /// The reported error, if any.
    pub fn errno(&self) -> Option<Errno> {
        (self.error != 0).then(|| Errno::from_raw(self.error))
    }

    /// The bytes actually transferred.
    pub fn transferred(&self) -> &[u8] {
        if self.result <= 0 {
            return &[];
        }
        let n = (self.result as usize).min(self.length).min(self.buffer.len());
        &self.buffer[..n]
    }
}

/// Completion callback. Whatever the closure captures plays the role of the
/// user argument.
pub type AioCallback = Box<dyn FnMut(&Completion<'_>) + Send>;

/// Kernel control block with a fixed heap address.
struct IocbCell(Box<UnsafeCell<Iocb>>);

// SAFETY: a shared reference only yields the raw address. The contents are
// written through `&mut self` before submission and by the kernel afterwards.
unsafe impl Sync for IocbCell {}

impl IocbCell {
    fn new() -> Self {
        Self(Box::new(UnsafeCell::new(Iocb::default())))
    }

    fn as_ptr(&self) -> *mut Iocb {
        self.0.get()
    }

    fn get_mut(&mut self) -> &mut Iocb {
        self.0.get_mut()
    }
}

struct CallbackSlot(Option<AioCallback>);

// SAFETY: the callback is only reachable through `&mut self`.
unsafe impl Sync for CallbackSlot {}

/// Progress of the completion callback of a `Completed` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchPhase {
    Waiting,
    Running,
    Done,
}

/// A single read or write request.
pub struct AioOp {
    kind: OpKind,
    fd: RawFd,
    buf: Vec<u8>,
    length: usize,
    offset: i64,
    priority: i16,
    state: OpState,
    result: i64,
    error: i32,
    dispatch: DispatchPhase,
    iocb: IocbCell,
    callback: CallbackSlot,
}

impl AioOp {
    /// Create an idle operation with a completion callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&Completion<'_>) + Send + 'static,
    {
        let mut op = Self::without_callback();
        op.callback = CallbackSlot(Some(Box::new(callback)));
        op
    }

    /// Create an idle operation whose completion is only observable through
    /// its state and result.
    pub fn without_callback() -> Self {
        Self {
            kind: OpKind::Read,
            fd: -1,
            buf: Vec::new(),
            length: 0,
            offset: 0,
            priority: 0,
            state: OpState::Idle,
            result: 0,
            error: 0,
            dispatch: DispatchPhase::Waiting,
            iocb: IocbCell::new(),
            callback: CallbackSlot(None),
        }
    }

    /// Replace the completion callback.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Completion<'_>) + Send + 'static,
    {
        self.callback = CallbackSlot(Some(Box::new(callback)));
    }

    /// Prepare a positional read of `length` bytes at `offset` into `buf`.
    pub fn prepare_read(
        &mut self,
        fd: RawFd,
        buf: Vec<u8>,
        length: usize,
        offset: i64,
        priority: i16,
    ) -> Result<(), AioError> {
        self.prepare(OpKind::Read, fd, buf, length, offset, priority)
    }

    /// Prepare a positional write of the first `length` bytes of `buf` at
    /// `offset`.
    pub fn prepare_write(
        &mut self,
        fd: RawFd,
        buf: Vec<u8>,
        length: usize,
        offset: i64,
        priority: i16,
    ) -> Result<(), AioError> {
        self.prepare(OpKind::Write, fd, buf, length, offset, priority)
    }

    fn prepare(
        &mut self,
        kind: OpKind,
        fd: RawFd,
        buf: Vec<u8>,
        length: usize,
        offset: i64,
        priority: i16,
    ) -> Result<(), AioError> {
        if fd < 0 {
            return Err(AioError::InvalidDescriptor(fd));
        }
        if offset < 0 {
            return Err(AioError::InvalidOffset(offset));
        }
        if length > buf.len() {
            return Err(AioError::BufferTooSmall {
                length,
                capacity: buf.len(),
            });
        }

        self.kind = kind;
        self.fd = fd;
        self.buf = buf;
        self.length = length;
        self.offset = offset;
        self.priority = priority;
        self.state = OpState::Prepared;
        self.result = 0;
        self.error = 0;
        self.dispatch = DispatchPhase::Waiting;
        Ok(())
    }

    /// Operation kind.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Target descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The operation buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Take the buffer out, leaving an empty one. The record must be prepared
    /// again before reuse.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.state = OpState::Idle;
        std::mem::take(&mut self.buf)
    }

    /// Requested length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Requested offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Priority hint passed to the kernel.
    pub fn priority(&self) -> i16 {
        self.priority
    }

    /// Current state.
    pub fn state(&self) -> OpState {
        self.state
    }

    /// Bytes transferred, `-1` on error.
    pub fn result(&self) -> i64 {
        self.result
    }

    /// Positive errno, `0` on success.
    pub fn error(&self) -> i32 {
        self.error
    }

    /// `Ok(bytes)` or the reported errno. `None` until the operation completed.
    pub fn outcome(&self) -> Option<Result<usize, Errno>> {
        if self.state != OpState::Completed {
            return None;
        }
        Some(if self.error != 0 {
            Err(Errno::from_raw(self.error))
        } else {
            Ok(self.result.max(0) as usize)
        })
    }

    // ------------------------------------------------------------------------
    // Transitions. Driven by the pending queue, pipeline, drain and cancel.
    // ------------------------------------------------------------------------

    /// Fill the kernel control block. `resfd` is the eventfd the kernel
    /// signals on completion.
    pub(crate) fn bind(&mut self, handle: OpHandle, resfd: RawFd) {
        assert!(self.state == OpState::Prepared);

        let kind = self.kind;
        let fd = self.fd;
        let buf = self.buf.as_mut_ptr() as u64;
        let length = self.length as u64;
        let offset = self.offset;
        let priority = self.priority;

        let iocb = self.iocb.get_mut();
        *iocb = Iocb::default();
        iocb.aio_data = handle.to_user_data();
        iocb.aio_lio_opcode = kind.opcode();
        iocb.aio_reqprio = priority;
        iocb.aio_fildes = fd as u32;
        iocb.aio_buf = buf;
        iocb.aio_nbytes = length;
        iocb.aio_offset = offset;
        iocb.aio_flags = IOCB_FLAG_RESFD;
        iocb.aio_resfd = resfd as u32;
    }

    pub(crate) fn iocb_ptr(&self) -> *mut Iocb {
        self.iocb.as_ptr()
    }

    pub(crate) fn set_queued(&mut self) {
        assert!(self.state == OpState::Prepared);
        self.state = OpState::Queued;
    }

    pub(crate) fn set_submitted(&mut self) {
        assert!(self.state == OpState::Queued);
        self.state = OpState::Submitted;
    }

    pub(crate) fn set_cancelled(&mut self) {
        assert!(self.state == OpState::Queued);
        self.state = OpState::Cancelled;
    }

    /// Resolve from a kernel completion record. Returns `false` without
    /// touching anything unless the operation is `Submitted`, which makes
    /// resolution idempotent when cancel races a natural completion.
    pub(crate) fn complete_from(&mut self, event: &IoEvent) -> bool {
        if self.state != OpState::Submitted {
            return false;
        }

        if event.res < 0 {
            self.result = -1;
            self.error = event.res.unsigned_abs().min(i32::MAX as u64) as i32;
        } else {
            self.result = event.res;
            self.error = 0;
        }
        self.state = OpState::Completed;
        true
    }

    /// Resolve a queued operation the kernel refused to accept.
    pub(crate) fn fail_submission(&mut self, errno: Errno) -> bool {
        if self.state != OpState::Queued {
            return false;
        }

        self.result = 0;
        self.error = errno as i32;
        self.state = OpState::Completed;
        true
    }

    /// Take what the callback needs. `None` once dispatched.
    pub(crate) fn begin_dispatch(&mut self) -> Option<Dispatch> {
        assert!(self.state == OpState::Completed);
        if self.dispatch != DispatchPhase::Waiting {
            return None;
        }
        self.dispatch = DispatchPhase::Running;

        Some(Dispatch {
            callback: self.callback.0.take(),
            buf: std::mem::take(&mut self.buf),
            kind: self.kind,
            length: self.length,
            offset: self.offset,
            result: self.result,
            error: self.error,
        })
    }

    /// Put back what [`begin_dispatch`](Self::begin_dispatch) took.
    pub(crate) fn end_dispatch(&mut self, dispatch: Dispatch) {
        self.buf = dispatch.buf;
        self.callback.0 = dispatch.callback;
        self.dispatch = DispatchPhase::Done;
    }

    /// `Cancelled`, or `Completed` with its callback finished.
    pub(crate) fn is_releasable(&self) -> bool {
        match self.state {
            OpState::Cancelled => true,
            OpState::Completed => self.dispatch == DispatchPhase::Done,
            _ => false,
        }
    }
}

impl fmt::Debug for AioOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioOp")
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("has_callback", &self.callback.0.is_some())
            .finish()
    }
}

/// Callback and buffer moved out of the table while the callback runs.
pub(crate) struct Dispatch {
    pub(crate) callback: Option<AioCallback>,
    buf: Vec<u8>,
    kind: OpKind,
    length: usize,
    offset: i64,
    result: i64,
    error: i32,
}

impl Dispatch {
    pub(crate) fn completion(&self, op: OpHandle) -> Completion<'_> {
        Completion {
            op,
            kind: self.kind,
            buffer: &self.buf,
            length: self.length,
            offset: self.offset,
            result: self.result,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared_read(len: usize) -> AioOp {
        let mut op = AioOp::without_callback();
        op.prepare_read(3, vec![0u8; len], len, 0, 0).unwrap();
        op
    }

    #[test]
    fn test_handle_user_data_roundtrip() {
        let handle = OpHandle::new(7, 42);
        let data = handle.to_user_data();
        assert_eq!(data, (42u64 << 32) | 7);
        assert_eq!(OpHandle::from_user_data(data), handle);
        assert_eq!(handle.to_string(), "op#7.42");
    }

    #[test]
    fn test_prepare_validates_arguments() {
        let mut op = AioOp::without_callback();
        assert!(matches!(
            op.prepare_read(-1, vec![0; 4], 4, 0, 0),
            Err(AioError::InvalidDescriptor(-1))
        ));
        assert!(matches!(
            op.prepare_read(3, vec![0; 4], 4, -8, 0),
            Err(AioError::InvalidOffset(-8))
        ));
        assert!(matches!(
            op.prepare_write(3, vec![0; 4], 5, 0, 0),
            Err(AioError::BufferTooSmall {
                length: 5,
                capacity: 4
            })
        ));
        assert_eq!(op.state(), OpState::Idle);

        op.prepare_write(3, vec![1; 8], 6, 512, 2).unwrap();
        assert_eq!(op.state(), OpState::Prepared);
        assert_eq!(op.kind(), OpKind::Write);
        assert_eq!(op.length(), 6);
        assert_eq!(op.offset(), 512);
        assert_eq!(op.priority(), 2);
    }

    #[test]
    fn test_bind_fills_control_block() {
        let mut op = AioOp::without_callback();
        op.prepare_write(9, vec![0; 16], 12, 4096, 1).unwrap();
        let handle = OpHandle::new(3, 5);
        op.bind(handle, 11);

        let iocb = *op.iocb.get_mut();
        assert_eq!(iocb.aio_data, handle.to_user_data());
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PWRITE);
        assert_eq!(iocb.aio_fildes, 9);
        assert_eq!(iocb.aio_nbytes, 12);
        assert_eq!(iocb.aio_offset, 4096);
        assert_eq!(iocb.aio_reqprio, 1);
        assert_eq!(iocb.aio_flags, IOCB_FLAG_RESFD);
        assert_eq!(iocb.aio_resfd, 11);
        assert_eq!(iocb.aio_buf, op.buffer().as_ptr() as u64);
    }

    #[test]
    fn test_complete_from_maps_results() {
        let mut op = prepared_read(10);
        op.set_queued();
        op.set_submitted();
        assert!(op.complete_from(&IoEvent {
            res: 10,
            ..Default::default()
        }));
        assert_eq!((op.result(), op.error()), (10, 0));
        assert_eq!(op.outcome(), Some(Ok(10)));

        let mut op = prepared_read(10);
        op.set_queued();
        op.set_submitted();
        assert!(op.complete_from(&IoEvent {
            res: -5,
            ..Default::default()
        }));
        assert_eq!((op.result(), op.error()), (-1, 5));
        assert_eq!(op.outcome(), Some(Err(Errno::EIO)));
    }

    #[test]
    fn test_complete_from_is_idempotent() {
        let mut op = prepared_read(4);
        op.set_queued();
        op.set_submitted();
        assert!(op.complete_from(&IoEvent {
            res: 4,
            ..Default::default()
        }));
        assert!(!op.complete_from(&IoEvent {
            res: -125,
            ..Default::default()
        }));
        assert_eq!((op.result(), op.error()), (4, 0));
    }

    #[test]
    fn test_fail_submission_only_from_queued() {
        let mut op = prepared_read(4);
        assert!(!op.fail_submission(Errno::EBADF));
        op.set_queued();
        assert!(op.fail_submission(Errno::EBADF));
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!((op.result(), op.error()), (0, Errno::EBADF as i32));
    }

    #[test]
    fn test_dispatch_happens_once() {
        let mut op = prepared_read(4);
        op.set_queued();
        op.set_submitted();
        op.complete_from(&IoEvent {
            res: 2,
            ..Default::default()
        });

        let dispatch = op.begin_dispatch().unwrap();
        let view = dispatch.completion(OpHandle::new(0, 1));
        assert_eq!(view.transferred().len(), 2);
        assert!(view.is_ok());
        assert!(!op.is_releasable());
        op.end_dispatch(dispatch);

        assert!(op.begin_dispatch().is_none());
        assert!(op.is_releasable());
        assert_eq!(op.buffer().len(), 4);
    }

    #[test]
    fn test_completed_not_releasable_before_dispatch() {
        let mut op = prepared_read(4);
        op.set_queued();
        assert!(!op.is_releasable());
        op.fail_submission(Errno::EBADF);
        assert!(!op.is_releasable());

        let mut cancelled = prepared_read(4);
        cancelled.set_queued();
        cancelled.set_cancelled();
        assert!(cancelled.is_releasable());
    }

    #[test]
    fn test_completion_view_error() {
        let view = Completion {
            op: OpHandle::new(1, 1),
            kind: OpKind::Read,
            buffer: &[1, 2, 3],
            length: 3,
            offset: 0,
            result: -1,
            error: Errno::ECANCELED as i32,
        };
        assert!(!view.is_ok());
        assert_eq!(view.errno(), Some(Errno::ECANCELED));
        assert!(view.transferred().is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(OpState::Completed.is_terminal());
        assert!(OpState::Cancelled.is_terminal());
        assert!(!OpState::Submitted.is_terminal());
        assert!(!OpState::Queued.is_terminal());
    }
}
