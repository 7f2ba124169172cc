use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use log::trace;

use crate::event_loop::{EventLoop, LoopHandle};

/// Invoked on each worker thread with its freshly built loop, before
/// the loop starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One OS thread running one [`EventLoop`].
///
/// The loop lives on the worker's stack; [`start`] blocks until the
/// worker has built it and published a handle. Dropping the
/// `EventLoopThread` quits the loop and joins the thread.
///
/// [`start`]: EventLoopThread::start
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    loop_: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            loop_: None,
            thread: None,
        }
    }

    /// Spawn the worker and wait for its loop to come up.
    pub fn start(&mut self) -> io::Result<LoopHandle> {
        assert!(self.thread.is_none(), "EventLoopThread started twice");

        type Slot = (Mutex<Option<io::Result<LoopHandle>>>, Condvar);
        let slot: Arc<Slot> = Arc::new((Mutex::new(None), Condvar::new()));
        let worker_slot = Arc::clone(&slot);
        let init = self.init.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        let (lock, cvar) = &*worker_slot;
                        *lock.lock().unwrap() = Some(Err(err));
                        cvar.notify_one();
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let (lock, cvar) = &*worker_slot;
                    *lock.lock().unwrap() = Some(Ok(event_loop.handle()));
                    cvar.notify_one();
                }
                event_loop.run();
                trace!("EventLoopThread finished");
            })?;

        let (lock, cvar) = &*slot;
        let mut published = lock.lock().unwrap();
        while published.is_none() {
            published = cvar.wait(published).unwrap();
        }
        let handle = published.take().unwrap()?;

        self.loop_ = Some(handle.clone());
        self.thread = Some(thread);
        Ok(handle)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            // Not a race even if the loop just exited: quit leaves the
            // flag set and join returns immediately.
            let _ = thread.join();
        }
    }
}

/// One-loop-per-thread pool.
///
/// Holds the caller's base loop plus N worker threads. Worker loops are
/// handed out round-robin for new connections, or pinned by hash for
/// sticky sessions. With zero threads everything runs on the base loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: AtomicUsize,
    started: AtomicBool,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: OnceLock<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            num_threads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: OnceLock::new(),
        }
    }

    /// Number of worker threads; must be set before [`start`].
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started(), "pool already started");
        self.num_threads.store(num_threads, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started.swap(true, Ordering::SeqCst), "pool started twice");

        let num_threads = self.num_threads.load(Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        let mut loops = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            loops.push(thread.start()?);
            threads.push(thread);
        }
        drop(threads);

        if num_threads == 0 {
            if let Some(init) = init {
                self.base.run_in_loop(move |lp| init(lp));
            }
        }

        let set = self.loops.set(loops);
        debug_assert!(set.is_ok());
        Ok(())
    }

    /// Next worker loop, round-robin, with its index. Falls back to
    /// `(0, base)` when the pool has no workers.
    pub fn next_loop(&self) -> (usize, LoopHandle) {
        assert!(self.started());
        let loops = self.loops.get().expect("pool not started");
        if loops.is_empty() {
            return (0, self.base.clone());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        (index, loops[index].clone())
    }

    /// Worker loop pinned by hash: the same hash always maps to the
    /// same loop.
    pub fn loop_for_hash(&self, hash: u64) -> LoopHandle {
        assert!(self.started());
        let loops = self.loops.get().expect("pool not started");
        if loops.is_empty() {
            return self.base.clone();
        }
        loops[(hash % loops.len() as u64) as usize].clone()
    }

    /// All worker loops, or the base loop for an empty pool.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        let loops = self.loops.get().expect("pool not started");
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }
}
