use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::{self, Waker};
use crate::timer::{next_sequence, Timer, TimerId, TimerQueue};

/// How long one poll may block. Actual wake-ups come earlier through
/// the waker fd (pending tasks) and the timer fd (due timers).
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    // Non-null exactly while `EventLoop::run` executes on this thread.
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
    // Set for the whole lifetime of the thread's loop; enforces
    // one-loop-per-thread at construction.
    static LOOP_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A single-threaded reactor: poll for readiness, dispatch channels,
/// run tasks posted from other threads, fire timers.
///
/// At most one `EventLoop` may exist per OS thread, it must be driven
/// by [`run`] on the thread that constructed it, and every object it
/// owns (poller, timer queue, channels, connections) may only be
/// touched from that thread. Other threads interact exclusively through
/// a [`LoopHandle`], which posts closures executed at the tail of a
/// loop iteration.
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    timers: TimerQueue,
    wake_channel: Arc<Channel>,
    active: RefCell<Vec<Arc<Channel>>>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
}

/// State reachable from other threads.
struct Shared {
    thread: ThreadId,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        sys::ignore_sigpipe();

        let waker = Waker::new()?;
        let shared = Arc::new(Shared {
            thread: thread::current().id(),
            waker,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });
        let handle = LoopHandle {
            shared: Arc::clone(&shared),
        };

        let poller = Poller::new()?;
        let timers = TimerQueue::new(handle.clone())?;
        let wake_channel = Arc::new(Channel::new(handle, shared.waker.as_raw_fd()));
        wake_channel.set_read_callback(|lp, _| lp.shared.waker.ack());

        LOOP_ON_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another EventLoop already exists on this thread"
            );
            flag.set(true);
        });

        let event_loop = EventLoop {
            shared,
            poller: RefCell::new(poller),
            timers,
            wake_channel,
            active: RefCell::new(Vec::new()),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            iteration: Cell::new(0),
        };
        event_loop.wake_channel.enable_reading(&event_loop);
        event_loop.timers.init(&event_loop);
        Ok(event_loop)
    }

    /// A cheap, cloneable, `Send + Sync` handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the reactor until [`quit`] is called.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run called reentrantly");
        self.looping.set(true);
        // The quit flag is deliberately not reset here: a quit that
        // arrives between construction and run must still stop the loop.
        let _current = CurrentLoopGuard::enter(self);
        trace!("EventLoop starts looping");

        while !self.shared.quit.load(Ordering::SeqCst) {
            let mut active = self.active.borrow_mut();
            active.clear();
            let receive_time = self
                .poller
                .borrow_mut()
                .poll(Some(POLL_TIMEOUT), &mut active);
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            for channel in active.iter() {
                channel.handle_event(self, receive_time);
            }
            self.event_handling.set(false);
            drop(active);

            self.run_pending_tasks();
        }

        trace!(
            "EventLoop stops looping after {} iterations",
            self.iteration.get()
        );
        self.looping.set(false);
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        // On the loop thread by definition, so no wake-up is needed:
        // the quit flag is re-checked before the next poll.
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {:?} was accessed from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
        }
    }

    /// Run `f` right away; the in-loop counterpart of
    /// [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce(&EventLoop)) {
        self.assert_in_loop_thread();
        f(self);
    }

    /// Post `f` to run at the tail of the current loop iteration.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.handle().queue_in_loop(f);
    }

    /// Schedule `f` at `when`.
    pub fn run_at<F>(&self, when: Instant, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(next_sequence(), when, None, Box::new(f));
        let id = timer.id();
        self.timers.add(self, timer);
        id
    }

    /// Schedule `f` after `delay`.
    pub fn run_after<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, f)
    }

    /// Schedule `f` every `interval`, first firing one interval from now.
    pub fn run_every<F>(&self, interval: Duration, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(
            next_sequence(),
            Instant::now() + interval,
            Some(interval),
            Box::new(f),
        );
        let id = timer.id();
        self.timers.add(self, timer);
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(self, id);
    }

    /// Number of scheduled timers; instrumentation.
    pub fn timer_count(&self) -> usize {
        self.assert_in_loop_thread();
        self.timers.len()
    }

    /// Completed poll iterations; instrumentation.
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            Arc::ptr_eq(&channel.owner().shared, &self.shared),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        assert!(
            Arc::ptr_eq(&channel.owner().shared, &self.shared),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    fn run_pending_tasks(&self) {
        // The flag goes up before the swap so a task posted by another
        // task still triggers a wake-up and runs next iteration instead
        // of being stranded until the poll times out.
        self.shared.calling_pending.store(true, Ordering::SeqCst);
        let tasks = mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(!self.looping.get());
        LOOP_ON_THREAD.with(|flag| flag.set(false));
        // The poller, waker and timer fds close with their owners, which
        // tears down every kernel registration in one go.
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread)
            .field("iteration", &self.iteration.get())
            .finish()
    }
}

/// Publishes the running loop for `LoopHandle::run_in_loop`'s immediate
/// path; cleared when `run` returns, panic or not.
struct CurrentLoopGuard;

impl CurrentLoopGuard {
    fn enter(event_loop: &EventLoop) -> CurrentLoopGuard {
        CURRENT_LOOP.with(|current| {
            assert!(current.get().is_null());
            current.set(event_loop as *const EventLoop);
        });
        CurrentLoopGuard
    }
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| current.set(ptr::null()));
    }
}

/// Cross-thread surface of an [`EventLoop`].
///
/// Everything here is safe to call from any thread. Closures posted
/// from one thread to one loop run in FIFO order relative to each
/// other.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Run `f` immediately when called on the loop's own thread while
    /// the loop is running, otherwise queue it.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        let mut f = Some(f);
        let ran = self
            .try_run_now(|lp| (f.take().unwrap())(lp))
            .is_some();
        if !ran {
            self.queue_in_loop(f.take().unwrap());
        }
    }

    /// Post `f` onto the loop's pending queue, waking the loop when the
    /// post comes from a foreign thread or lands during the drain of the
    /// queue (in both cases nobody would otherwise look again soon).
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(f));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Make the next (or current) poll return immediately.
    pub fn wakeup(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!("EventLoop wakeup failed: {}", err);
        }
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Schedule `f` at `when`. Safe from any thread.
    pub fn run_at<F>(&self, when: Instant, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(next_sequence(), when, None, Box::new(f));
        let id = timer.id();
        self.run_in_loop(move |lp| lp.timers().add(lp, timer));
        id
    }

    /// Schedule `f` after `delay`. Safe from any thread.
    pub fn run_after<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, f)
    }

    /// Schedule `f` every `interval`. Safe from any thread.
    pub fn run_every<F>(&self, interval: Duration, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(
            next_sequence(),
            Instant::now() + interval,
            Some(interval),
            Box::new(f),
        );
        let id = timer.id();
        self.run_in_loop(move |lp| lp.timers().add(lp, timer));
        id
    }

    /// Cancel a scheduled timer. If the timer is firing right now the
    /// in-flight callback still completes, but a repeating timer will
    /// not be restarted.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move |lp| lp.timers().cancel(lp, id));
    }

    /// Length of the pending-task queue; instrumentation.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Run `f` against the loop right now if this thread is the loop's
    /// thread and the loop is inside [`EventLoop::run`].
    pub(crate) fn try_run_now<R>(&self, f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        if !self.is_in_loop_thread() {
            return None;
        }
        CURRENT_LOOP.with(|current| {
            let current = current.get();
            if current.is_null() {
                return None;
            }
            // SAFETY: the pointer was published by `run` on this very
            // thread and is cleared before `run` returns, so it refers
            // to a live loop for the duration of this call.
            let lp = unsafe { &*current };
            if Arc::ptr_eq(&lp.shared, &self.shared) {
                Some(f(lp))
            } else {
                None
            }
        })
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}
