//! Kernel AIO ABI mirrors.
//!
//! `libc` does not expose the native AIO control block or completion record,
//! so they are declared here with the exact layout of `<linux/aio_abi.h>`.

use std::mem::size_of;

/// `IOCB_CMD_PREAD`
pub const IOCB_CMD_PREAD: u16 = 0;
/// `IOCB_CMD_PWRITE`
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Signal `aio_resfd` (an eventfd) when the request completes.
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// Kernel AIO control block (`struct iocb`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Iocb {
    /// Returned verbatim in [`IoEvent::data`].
    pub aio_data: u64,
    /// Written by the kernel on submission.
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    /// `RWF_*` flags.
    #[cfg(target_endian = "little")]
    pub aio_rw_flags: i32,
    /// `RWF_*` flags.
    #[cfg(target_endian = "big")]
    pub aio_rw_flags: i32,
    /// Written by the kernel on submission.
    #[cfg(target_endian = "big")]
    pub aio_key: u32,
    /// One of the `IOCB_CMD_*` opcodes.
    pub aio_lio_opcode: u16,
    /// Request priority hint.
    pub aio_reqprio: i16,
    /// Target file descriptor.
    pub aio_fildes: u32,
    /// Buffer address.
    pub aio_buf: u64,
    /// Buffer length in bytes.
    pub aio_nbytes: u64,
    /// File offset.
    pub aio_offset: i64,
    /// Reserved, must be zero.
    pub aio_reserved2: u64,
    /// `IOCB_FLAG_*` flags.
    pub aio_flags: u32,
    /// Eventfd signalled on completion when [`IOCB_FLAG_RESFD`] is set.
    pub aio_resfd: u32,
}

/// Kernel AIO completion record (`struct io_event`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoEvent {
    /// The submitting [`Iocb::aio_data`].
    pub data: u64,
    /// Address of the submitting [`Iocb`].
    pub obj: u64,
    /// Bytes transferred, or a negated errno.
    pub res: i64,
    /// Secondary result, unused for reads and writes.
    pub res2: i64,
}

const _: () = assert!(size_of::<Iocb>() == 64, "struct iocb is 64 bytes");
const _: () = assert!(size_of::<IoEvent>() == 32, "struct io_event is 32 bytes");
