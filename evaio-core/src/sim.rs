//! Deterministic in-process [`Kernel`].
//!
//! Requests are accepted into a FIFO and completed only when the test says
//! so, which makes capacity pressure, partial acceptance, hard failures and
//! cancel races reproducible. Completion signals the request's eventfd the
//! way the real kernel does with `IOCB_FLAG_RESFD`.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use tracing::warn;

use crate::abi::{IoEvent, Iocb, IOCB_FLAG_RESFD};
use crate::kernel::Kernel;

/// A request the simulated kernel holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRequest {
    /// Control block address, reported back as [`IoEvent::obj`].
    pub obj: u64,
    /// `aio_data`.
    pub data: u64,
    /// `aio_lio_opcode`.
    pub opcode: u16,
    /// `aio_fildes`.
    pub fd: u32,
    /// `aio_nbytes`.
    pub nbytes: u64,
    /// `aio_offset`.
    pub offset: i64,
    /// Eventfd to signal, if `IOCB_FLAG_RESFD` was set.
    pub resfd: Option<RawFd>,
}

impl SimRequest {
    fn from_iocb(obj: u64, iocb: &Iocb) -> Self {
        Self {
            obj,
            data: iocb.aio_data,
            opcode: iocb.aio_lio_opcode,
            fd: iocb.aio_fildes,
            nbytes: iocb.aio_nbytes,
            offset: iocb.aio_offset,
            resfd: (iocb.aio_flags & IOCB_FLAG_RESFD != 0).then_some(iocb.aio_resfd as RawFd),
        }
    }

    fn event(&self, res: i64) -> IoEvent {
        IoEvent {
            data: self.data,
            obj: self.obj,
            res,
            res2: 0,
        }
    }
}

/// Simulated kernel completion context.
#[derive(Debug)]
pub struct SimKernel {
    capacity: usize,
    accept_limit: Option<usize>,
    submit_error: Option<Errno>,
    cancel_error: Option<Errno>,
    in_flight: VecDeque<SimRequest>,
    ready: VecDeque<IoEvent>,
    submit_calls: usize,
    get_events_calls: usize,
    peak_in_flight: usize,
}

impl SimKernel {
    /// A kernel holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            accept_limit: None,
            submit_error: None,
            cancel_error: None,
            in_flight: VecDeque::new(),
            ready: VecDeque::new(),
            submit_calls: 0,
            get_events_calls: 0,
            peak_in_flight: 0,
        }
    }

    /// Setup function for [`AioContext::with_kernel`](crate::AioContext::with_kernel).
    pub fn setup(capacity: usize) -> io::Result<Self> {
        Ok(Self::new(capacity))
    }

    /// Accept at most `limit` requests per submission call. `Some(0)` makes
    /// every submission fail with `EAGAIN`.
    pub fn set_accept_limit(&mut self, limit: Option<usize>) {
        self.accept_limit = limit;
    }

    /// Fail every submission with `errno`.
    pub fn fail_submissions(&mut self, errno: Option<Errno>) {
        self.submit_error = errno;
    }

    /// Reject every cancel with `errno`.
    pub fn fail_cancels(&mut self, errno: Option<Errno>) {
        self.cancel_error = errno;
    }

    /// Complete the oldest in-flight request with `res`. Returns its
    /// `aio_data`.
    pub fn complete_next(&mut self, res: i64) -> Option<u64> {
        let request = self.in_flight.pop_front()?;
        self.finish(request, res);
        Some(request.data)
    }

    /// Complete the in-flight request carrying `data`.
    pub fn complete(&mut self, data: u64, res: i64) -> bool {
        match self.in_flight.iter().position(|r| r.data == data) {
            Some(pos) => {
                if let Some(request) = self.in_flight.remove(pos) {
                    self.finish(request, res);
                }
                true
            }
            None => false,
        }
    }

    /// Complete every in-flight request, `res` computed per request.
    pub fn complete_all<F>(&mut self, mut res: F) -> usize
    where
        F: FnMut(&SimRequest) -> i64,
    {
        let mut count = 0;
        while let Some(request) = self.in_flight.pop_front() {
            let value = res(&request);
            self.finish(request, value);
            count += 1;
        }
        count
    }

    /// Queue a completion record without signalling anything.
    pub fn inject_ready(&mut self, event: IoEvent) {
        self.ready.push_back(event);
    }

    /// Requests accepted and not yet completed, oldest first.
    pub fn in_flight_requests(&self) -> impl Iterator<Item = &SimRequest> + '_ {
        self.in_flight.iter()
    }

    /// Number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Completion records waiting for `get_events`.
    pub fn ready(&self) -> usize {
        self.ready.len()
    }

    /// Highest in-flight count seen.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Number of `submit` calls.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls
    }

    /// Number of `get_events` calls.
    pub fn get_events_calls(&self) -> usize {
        self.get_events_calls
    }

    fn finish(&mut self, request: SimRequest, res: i64) {
        self.ready.push_back(request.event(res));
        if let Some(fd) = request.resfd {
            if let Err(errno) = signal(fd) {
                warn!(fd, %errno, data = request.data, "completion signal not delivered");
                debug_assert!(false, "eventfd {fd} signal failed: {errno}");
            }
        }
    }
}

/// Add one to the eventfd counter, as the kernel does for `IOCB_FLAG_RESFD`.
fn signal(fd: RawFd) -> Result<(), Errno> {
    let one: u64 = 1;
    // SAFETY: writing 8 bytes from a u64.
    let written = unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
    match written {
        8 => Ok(()),
        n if n < 0 => Err(Errno::last()),
        _ => Err(Errno::EIO),
    }
}

impl Kernel for SimKernel {
    const NAME: &'static str = "simulated AIO";

    unsafe fn submit(&mut self, iocbs: &[*mut Iocb]) -> Result<usize, Errno> {
        self.submit_calls += 1;
        if let Some(errno) = self.submit_error {
            return Err(errno);
        }
        if iocbs.is_empty() {
            return Ok(0);
        }

        let room = self.capacity.saturating_sub(self.in_flight.len());
        let accept = iocbs
            .len()
            .min(room)
            .min(self.accept_limit.unwrap_or(usize::MAX));
        if accept == 0 {
            return Err(Errno::EAGAIN);
        }

        for &iocb in &iocbs[..accept] {
            // SAFETY: the caller guarantees each pointer is a live control block.
            let block = unsafe { *iocb };
            self.in_flight
                .push_back(SimRequest::from_iocb(iocb as usize as u64, &block));
        }
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        Ok(accept)
    }

    fn get_events(
        &mut self,
        _min_nr: usize,
        events: &mut [IoEvent],
        _timeout: Duration,
    ) -> Result<usize, Errno> {
        self.get_events_calls += 1;
        let n = events.len().min(self.ready.len());
        for (slot, event) in events.iter_mut().zip(self.ready.drain(..n)) {
            *slot = event;
        }
        Ok(n)
    }

    unsafe fn cancel(&mut self, iocb: *mut Iocb, result: &mut IoEvent) -> Result<(), Errno> {
        if let Some(errno) = self.cancel_error {
            return Err(errno);
        }
        let obj = iocb as usize as u64;
        let pos = self
            .in_flight
            .iter()
            .position(|r| r.obj == obj)
            .ok_or(Errno::EAGAIN)?;
        let request = self.in_flight.remove(pos).ok_or(Errno::EAGAIN)?;
        *result = request.event(-i64::from(Errno::ECANCELED as i32));
        Ok(())
    }
}
