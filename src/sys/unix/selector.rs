use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::interest::Interest;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly asked for that.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

// Level-triggered on purpose: the reactor dispatches each readiness once
// per poll and relies on the kernel to report again while the condition
// holds, so a partial read or write cannot strand a connection.
fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;

    if interests.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= libc::EPOLLOUT;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use crate::sys::Event;
    use std::os::fd::RawFd;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    pub(crate) fn mask(event: &Event) -> u32 {
        event.events
    }

    pub(crate) fn is_readable(mask: u32) -> bool {
        (mask as libc::c_int & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP)) != 0
    }

    pub(crate) fn is_writable(mask: u32) -> bool {
        (mask as libc::c_int & libc::EPOLLOUT) != 0
    }

    pub(crate) fn is_error(mask: u32) -> bool {
        (mask as libc::c_int & libc::EPOLLERR) != 0
    }

    /// Peer hung up and nothing is left to read.
    ///
    /// `EPOLLHUP` alone means both halves are gone; while readable data is
    /// still queued the read path must run first so it is not discarded.
    pub(crate) fn is_hup_without_input(mask: u32) -> bool {
        (mask as libc::c_int & libc::EPOLLHUP) != 0 && (mask as libc::c_int & libc::EPOLLIN) == 0
    }
}
