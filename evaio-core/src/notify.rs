//! Completion notification descriptor.
//!
//! The kernel adds one to the eventfd counter per completed request. A read
//! returns the accumulated count and resets it, which the drain loop uses as
//! a hint for how many records to collect.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::libc;

/// Non-blocking, close-on-exec eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create with a zero counter.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read and reset the counter. `Ok(0)` when nothing was signalled.
    pub fn read_count(&self) -> io::Result<u64> {
        let mut count: u64 = 0;
        loop {
            // SAFETY: reading 8 bytes into a u64.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut count as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            match n {
                8 => return Ok(count),
                0 => return Ok(0),
                n if n < 0 => match Errno::last() {
                    Errno::EAGAIN => return Ok(0),
                    Errno::EINTR => continue,
                    errno => return Err(io::Error::from(errno)),
                },
                n => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("short eventfd read of {n} bytes"),
                    ))
                }
            }
        }
    }

    /// Add `n` to the counter.
    pub fn signal(&self, n: u64) -> io::Result<()> {
        loop {
            // SAFETY: writing 8 bytes from a u64.
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &n as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(io::Error::from(errno)),
            }
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_read_is_zero() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.read_count().unwrap(), 0);
    }

    #[test]
    fn test_signal_accumulates_and_resets() {
        let efd = EventFd::new().unwrap();
        efd.signal(1).unwrap();
        efd.signal(2).unwrap();
        assert_eq!(efd.read_count().unwrap(), 3);
        assert_eq!(efd.read_count().unwrap(), 0);
    }

    #[test]
    fn test_close_on_exec() {
        let efd = EventFd::new().unwrap();
        // SAFETY: F_GETFD on a valid descriptor.
        let flags = unsafe { libc::fcntl(efd.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }
}
