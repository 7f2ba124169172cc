use std::collections::{BTreeMap, HashMap, HashSet};
use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::TimerFd;

/// Identifies one scheduled timer, for [`cancel`].
///
/// Sequence numbers are drawn from one process-wide counter and never
/// reused, so a stale id can never cancel a timer it did not create.
///
/// [`cancel`]: crate::event_loop::LoopHandle::cancel
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct Timer {
    sequence: u64,
    expiration: Instant,
    interval: Option<Duration>,
    callback: Box<dyn FnMut() + Send>,
}

impl Timer {
    pub(crate) fn new(
        sequence: u64,
        expiration: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> Timer {
        Timer {
            sequence,
            expiration,
            interval,
            callback,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId(self.sequence)
    }

    fn restart(&mut self, now: Instant) {
        // Only repeating timers are restarted.
        self.expiration = now + self.interval.unwrap();
    }
}

/// Priority set of timers backed by one kernel timer fd.
///
/// Owned by an [`EventLoop`] and touched only from its thread, so no
/// lock is needed; the thread-safe entry points live on [`LoopHandle`]
/// and forward here as in-loop tasks.
///
/// Membership is tracked twice: `timers` ordered by `(expiration,
/// sequence)` for next-to-fire extraction, and `active` keyed by
/// sequence for cancel lookup. The two always hold the same timers.
pub(crate) struct TimerQueue {
    fd: TimerFd,
    channel: Arc<Channel>,
    timers: RefCell<BTreeMap<(Instant, u64), Timer>>,
    active: RefCell<HashMap<u64, Instant>>,
    calling_expired: Cell<bool>,
    cancelling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn new(owner: LoopHandle) -> io::Result<TimerQueue> {
        let fd = TimerFd::new()?;
        let channel = Arc::new(Channel::new(owner, fd.as_raw_fd()));
        channel.set_read_callback(|lp, _| lp.timers().handle_expired(lp));
        Ok(TimerQueue {
            fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            calling_expired: Cell::new(false),
            cancelling: RefCell::new(HashSet::new()),
        })
    }

    /// Register the timer fd with the loop's poller. The fd stays under
    /// read interest forever; it is disarmed with `timerfd_settime`, not
    /// by dropping interest.
    pub(crate) fn init(&self, lp: &EventLoop) {
        self.channel.enable_reading(lp);
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        self.timers.borrow().len()
    }

    pub(crate) fn add(&self, lp: &EventLoop, timer: Timer) {
        lp.assert_in_loop_thread();
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            let when = self.timers.borrow().keys().next().unwrap().0;
            self.arm(when);
        }
    }

    pub(crate) fn cancel(&self, lp: &EventLoop, id: TimerId) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        let expiration = self.active.borrow_mut().remove(&id.0);
        match expiration {
            Some(expiration) => {
                let removed = self.timers.borrow_mut().remove(&(expiration, id.0));
                assert!(removed.is_some());
            }
            None if self.calling_expired.get() => {
                // Racing with its own firing: the callback runs this one
                // last time, the post-firing reset will not restart it.
                self.cancelling.borrow_mut().insert(id.0);
            }
            None => {}
        }
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
    }

    /// Timer fd turned readable: fire everything due, then restart the
    /// repeating survivors and re-arm.
    fn handle_expired(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let now = Instant::now();
        self.fd.ack();

        let mut expired = self.take_expired(now);
        trace!("{} timer(s) expired", expired.len());

        self.calling_expired.set(true);
        self.cancelling.borrow_mut().clear();
        // Callbacks run with no internal borrow held, so they are free
        // to add or cancel timers.
        for timer in &mut expired {
            (timer.callback)();
        }
        self.calling_expired.set(false);

        self.reset(expired, now);
    }

    /// Remove and return every timer with `expiration <= now`.
    ///
    /// The split sentinel is `(now, u64::MAX)`: a real timer at exactly
    /// `now` carries a smaller sequence and therefore sorts strictly
    /// below it, which makes the extraction boundary deterministic.
    fn take_expired(&self, now: Instant) -> Vec<Timer> {
        let mut timers = self.timers.borrow_mut();
        let remaining = timers.split_off(&(now, u64::MAX));
        let expired: Vec<Timer> = mem::replace(&mut *timers, remaining)
            .into_values()
            .collect();
        drop(timers);

        let mut active = self.active.borrow_mut();
        for timer in &expired {
            let removed = active.remove(&timer.sequence);
            assert!(removed.is_some());
        }
        drop(active);

        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        expired
    }

    fn reset(&self, expired: Vec<Timer>, now: Instant) {
        let cancelling = self.cancelling.borrow();
        for mut timer in expired {
            if timer.interval.is_some() && !cancelling.contains(&timer.sequence) {
                timer.restart(now);
                self.insert(timer);
            }
            // One-shot or cancelled timers are dropped here.
        }
        drop(cancelling);

        if let Some(&(when, _)) = self.timers.borrow().keys().next() {
            self.arm(when);
        }
    }

    /// Insert into both sets; true if the new timer is now the earliest.
    fn insert(&self, timer: Timer) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        debug_assert_eq!(timers.len(), active.len());

        let when = timer.expiration;
        let earliest_changed = timers
            .keys()
            .next()
            .map_or(true, |&(earliest, _)| when < earliest);

        let prev = active.insert(timer.sequence, when);
        debug_assert!(prev.is_none());
        let prev = timers.insert((when, timer.sequence), timer);
        debug_assert!(prev.is_none());

        earliest_changed
    }

    fn arm(&self, when: Instant) {
        if let Err(err) = self.fd.arm(when) {
            error!("timerfd_settime failed: {}", err);
        }
    }
}
