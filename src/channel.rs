use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::warn;

use crate::event_loop::{EventLoop, LoopHandle};
use crate::interest::Interest;
use crate::sys::event;

/// Callback for read readiness; receives the poll return timestamp.
pub type ReadEventCallback = Arc<dyn Fn(&EventLoop, Instant) + Send + Sync>;
/// Callback for write readiness, peer hang-up or a socket error.
pub type EventCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Registration state of a channel within its poller.
pub(crate) const STATE_NEW: i8 = -1;
pub(crate) const STATE_ADDED: i8 = 1;
pub(crate) const STATE_DELETED: i8 = 2;

/// One file descriptor's interest set and ready-event dispatch record.
///
/// A `Channel` is bound at construction to one `(loop, fd)` pair and
/// never owns the descriptor; the owner (connection, acceptor, or the
/// loop itself for its internal fds) closes it. Every method that talks
/// to the poller takes the owning [`EventLoop`] and must run on its
/// thread.
///
/// Interest and ready masks are atomics only so the structure can sit
/// inside an `Arc` that crosses threads (a connection handle); all
/// mutation still happens on the owning loop's thread.
pub struct Channel {
    fd: RawFd,
    owner: LoopHandle,
    interest: AtomicU8,
    ready: AtomicU32,
    index: AtomicI8,
    handlers: Mutex<Handlers>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

#[derive(Default)]
struct Handlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

impl Channel {
    pub fn new(owner: LoopHandle, fd: RawFd) -> Channel {
        Channel {
            fd,
            owner,
            interest: AtomicU8::new(0),
            ready: AtomicU32::new(0),
            index: AtomicI8::new(STATE_NEW),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn owner(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn set_read_callback<F>(&self, f: F)
    where
        F: Fn(&EventLoop, Instant) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().read = Some(Arc::new(f));
    }

    pub fn set_write_callback<F>(&self, f: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().write = Some(Arc::new(f));
    }

    pub fn set_close_callback<F>(&self, f: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().close = Some(Arc::new(f));
    }

    pub fn set_error_callback<F>(&self, f: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().error = Some(Arc::new(f));
    }

    /// Tie this channel to its owner object.
    ///
    /// Before dispatching any event the weak reference is upgraded and
    /// held for the duration of the dispatch, so callbacks cannot run
    /// against an owner whose last strong reference dropped mid-poll; if
    /// the upgrade fails the dispatch is skipped entirely.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.lock().unwrap() = Some(weak);
    }

    pub fn interest(&self) -> Option<Interest> {
        Interest::from_u8(self.interest.load(Ordering::Relaxed))
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_some_and(Interest::is_readable)
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_some_and(Interest::is_writable)
    }

    pub fn enable_reading(self: &Arc<Self>, lp: &EventLoop) {
        self.add_interest(lp, Interest::READABLE);
    }

    pub fn enable_writing(self: &Arc<Self>, lp: &EventLoop) {
        self.add_interest(lp, Interest::WRITABLE);
    }

    pub fn disable_reading(self: &Arc<Self>, lp: &EventLoop) {
        self.del_interest(lp, Interest::READABLE);
    }

    pub fn disable_writing(self: &Arc<Self>, lp: &EventLoop) {
        self.del_interest(lp, Interest::WRITABLE);
    }

    pub fn disable_all(self: &Arc<Self>, lp: &EventLoop) {
        self.interest.store(0, Ordering::Relaxed);
        lp.update_channel(self);
    }

    /// Unregister from the poller. Interest must be disabled first.
    pub fn remove(&self, lp: &EventLoop) {
        assert!(self.interest().is_none(), "removing a channel with live interest");
        lp.remove_channel(self);
    }

    fn add_interest(self: &Arc<Self>, lp: &EventLoop, interest: Interest) {
        let bits = match self.interest() {
            Some(cur) => cur.add(interest),
            None => interest,
        };
        self.interest.store(bits.as_u8(), Ordering::Relaxed);
        lp.update_channel(self);
    }

    fn del_interest(self: &Arc<Self>, lp: &EventLoop, interest: Interest) {
        let bits = self.interest().and_then(|cur| cur.remove(interest));
        self.interest
            .store(bits.map_or(0, Interest::as_u8), Ordering::Relaxed);
        lp.update_channel(self);
    }

    pub(crate) fn poller_state(&self) -> i8 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_poller_state(&self, state: i8) {
        self.index.store(state, Ordering::Relaxed);
    }

    pub(crate) fn set_ready(&self, mask: u32) {
        self.ready.store(mask, Ordering::Relaxed);
    }

    /// Dispatch the ready events recorded by the last poll.
    pub(crate) fn handle_event(self: &Arc<Self>, lp: &EventLoop, receive_time: Instant) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(weak) => {
                // The guard keeps the owner alive across every callback
                // below; a failed upgrade means the owner is already gone.
                if let Some(_guard) = weak.upgrade() {
                    self.dispatch(lp, receive_time);
                }
            }
            None => self.dispatch(lp, receive_time),
        }
    }

    fn dispatch(&self, lp: &EventLoop, receive_time: Instant) {
        let mask = self.ready.load(Ordering::Relaxed);
        let handlers = {
            let guard = self.handlers.lock().unwrap();
            (
                guard.read.clone(),
                guard.write.clone(),
                guard.close.clone(),
                guard.error.clone(),
            )
        };
        let (read, write, close, error) = handlers;

        if event::is_hup_without_input(mask) {
            warn!("channel fd = {} received POLLHUP", self.fd);
            if let Some(close) = close {
                close(lp);
            }
        }

        if event::is_error(mask) {
            if let Some(error) = error {
                error(lp);
            }
        }

        if event::is_readable(mask) {
            if let Some(read) = read {
                read(lp, receive_time);
            }
        }

        if event::is_writable(mask) {
            if let Some(write) = write {
                write(lp);
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}
