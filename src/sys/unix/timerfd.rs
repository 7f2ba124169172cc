use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Instant;

use log::warn;

/// Kernel timer descriptor.
///
/// Becomes readable when the armed expiration passes; the read returns
/// the number of expirations since the last read. One of these backs the
/// whole timer queue of a loop: it is always kept under read interest and
/// re-armed with `arm` to the earliest pending expiration.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        // SAFETY: `timerfd_create(2)` just returned this fd and nothing
        // else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(TimerFd { fd: file })
    }

    /// Arm the descriptor to expire at `when`.
    ///
    /// An expiration in the past is clamped to 100 µs from now so the
    /// relative `timerfd_settime` never disarms the timer with a zero
    /// value.
    pub(crate) fn arm(&self, when: Instant) -> io::Result<()> {
        const MIN_DELAY_NANOS: u64 = 100_000;

        let delay = when
            .saturating_duration_since(Instant::now())
            .as_nanos()
            .max(MIN_DELAY_NANOS as u128) as u64;

        // SAFETY: all-zero is a valid `itimerspec`.
        let mut new_value: libc::itimerspec = unsafe { mem::zeroed() };
        new_value.it_value.tv_sec = (delay / 1_000_000_000) as libc::time_t;
        new_value.it_value.tv_nsec = (delay % 1_000_000_000) as libc::c_long;

        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    /// Drain the expiration count so the level-triggered poller stops
    /// reporting the fd as readable.
    pub(crate) fn ack(&self) {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(n) if n != 8 => warn!("timerfd read returned {} bytes instead of 8", n),
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("timerfd read failed: {}", err),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
