//! Kernel completion interface.
//!
//! [`Kernel`] is the seam between the backend and the native AIO syscalls.
//! [`LinuxAio`] issues them for real; [`SimKernel`](crate::sim::SimKernel)
//! stands in for it in tests and benchmarks.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use tracing::{debug, warn};

use crate::abi::{IoEvent, Iocb};

/// Native asynchronous I/O completion context.
pub trait Kernel {
    /// Backend name used in logs.
    const NAME: &'static str;

    /// Submit control blocks. Returns how many, from the front of `iocbs`,
    /// were accepted. `Err(EAGAIN)` means the kernel is out of resources.
    ///
    /// # Safety
    ///
    /// Every pointer must reference a control block, and the buffer it
    /// describes, that stays valid and unmoved until the request is
    /// resolved by [`get_events`](Self::get_events) or
    /// [`cancel`](Self::cancel), or until the kernel context is destroyed.
    unsafe fn submit(&mut self, iocbs: &[*mut Iocb]) -> Result<usize, Errno>;

    /// Retrieve between `min_nr` and `events.len()` completion records,
    /// waiting at most `timeout`.
    fn get_events(
        &mut self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> Result<usize, Errno>;

    /// Attempt to cancel a submitted request. On success `result` holds the
    /// request's completion record and no other record will be delivered
    /// for it.
    ///
    /// # Safety
    ///
    /// `iocb` must be a control block previously accepted by
    /// [`submit`](Self::submit).
    unsafe fn cancel(&mut self, iocb: *mut Iocb, result: &mut IoEvent) -> Result<(), Errno>;
}

/// Kernel context handle (`aio_context_t`).
type AioContextId = libc::c_ulong;

/// Linux native AIO (`io_setup(2)` and friends).
#[derive(Debug)]
pub struct LinuxAio {
    ctx: AioContextId,
    capacity: usize,
}

impl LinuxAio {
    /// Create a kernel context able to hold `capacity` requests in flight.
    pub fn setup(capacity: usize) -> io::Result<Self> {
        let nr_events = libc::c_uint::try_from(capacity)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut ctx: AioContextId = 0;

        // SAFETY: `ctx` is a valid out-pointer and starts at zero as io_setup requires.
        let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr_events, &mut ctx as *mut AioContextId) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!(capacity, "kernel AIO context created");
        Ok(Self { ctx, capacity })
    }

    /// Requested capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Kernel for LinuxAio {
    const NAME: &'static str = "Linux AIO";

    unsafe fn submit(&mut self, iocbs: &[*mut Iocb]) -> Result<usize, Errno> {
        if iocbs.is_empty() {
            return Ok(0);
        }

        // SAFETY: the caller upholds the control-block contract; the kernel
        // only reads the pointer array.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                iocbs.len() as libc::c_long,
                iocbs.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(ret as usize)
    }

    fn get_events(
        &mut self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        let nr = events.len();
        let min_nr = min_nr.min(nr);
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        loop {
            // SAFETY: `events` has room for `nr` records and `ts` is a valid timespec.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min_nr as libc::c_long,
                    nr as libc::c_long,
                    events.as_mut_ptr(),
                    &mut ts as *mut libc::timespec,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(errno),
            }
        }
    }

    unsafe fn cancel(&mut self, iocb: *mut Iocb, result: &mut IoEvent) -> Result<(), Errno> {
        // SAFETY: the caller guarantees `iocb` was accepted by this context.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_cancel,
                self.ctx,
                iocb,
                result as *mut IoEvent,
            )
        };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        // io_destroy waits for in-flight requests, so buffers stay valid until it returns.
        // SAFETY: `ctx` came from io_setup and is destroyed exactly once.
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 {
            warn!(error = %io::Error::last_os_error(), "io_destroy failed");
        }
    }
}
