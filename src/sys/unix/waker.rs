use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Cross-thread wake-up backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be 8 bytes
/// and add to the count; reads must be 8 bytes and reset the count to 0.
/// The fd is registered read-only with the owning loop's poller, so a
/// non-zero count makes the next `epoll_wait` return immediately.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` just returned this fd and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter would overflow.
                // Reset it to 0 and wake again.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drain the counter. Must run on every wake-up event: the fd is
    /// polled level-triggered and stays readable until read.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn ack(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        // `WouldBlock` means another ack already got here; fine either way.
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
