use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::logging::log_file::LogFile;

const LARGE_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Pending buffers beyond this are dropped with a marker line; discard
/// beats unbounded memory when the producer outruns the disk.
const DROP_THRESHOLD: usize = 25;

/// Fixed-size fill-once byte buffer; the handoff unit between the log
/// front end and the writer thread.
struct FixedBuffer {
    data: Vec<u8>,
}

impl FixedBuffer {
    fn new(size: usize) -> FixedBuffer {
        FixedBuffer {
            data: Vec::with_capacity(size),
        }
    }

    fn avail(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    fn append(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.avail());
        self.data.extend_from_slice(bytes);
    }

    fn reset(&mut self) {
        self.data.clear();
    }
}

/// Simple one-shot countdown, used to hold `start` until the writer
/// thread is up.
struct CountDownLatch {
    count: Mutex<u32>,
    cond: Condvar,
}

impl CountDownLatch {
    fn new(count: u32) -> CountDownLatch {
        CountDownLatch {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }

    fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }
}

struct State {
    current: FixedBuffer,
    next: Option<FixedBuffer>,
    pending: Vec<FixedBuffer>,
}

struct Inner {
    basename: String,
    roll_size: u64,
    flush_interval: Duration,
    buffer_size: usize,
    running: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
    latch: CountDownLatch,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Asynchronous double-buffered log sink.
///
/// The front end ([`append`]) fills one large buffer under a mutex and
/// only signals the writer when a buffer fills up, so the hot path is a
/// memcpy plus an uncontended lock. The writer thread swaps the filled
/// buffers out wholesale every `flush_interval` (or on signal), writes
/// them to a rolling [`LogFile`], and recycles two of them as spares,
/// keeping the steady state allocation-free.
///
/// Clones share the same sink.
///
/// [`append`]: AsyncLogging::append
#[derive(Clone)]
pub struct AsyncLogging {
    inner: Arc<Inner>,
}

impl AsyncLogging {
    pub fn new(basename: impl Into<String>, roll_size: u64) -> AsyncLogging {
        Self::with_options(basename, roll_size, DEFAULT_FLUSH_INTERVAL, LARGE_BUFFER_SIZE)
    }

    /// Full-control constructor; `buffer_size` is the size of each
    /// handoff buffer (4 MiB by default).
    pub fn with_options(
        basename: impl Into<String>,
        roll_size: u64,
        flush_interval: Duration,
        buffer_size: usize,
    ) -> AsyncLogging {
        AsyncLogging {
            inner: Arc::new(Inner {
                basename: basename.into(),
                roll_size,
                flush_interval,
                buffer_size,
                running: AtomicBool::new(false),
                state: Mutex::new(State {
                    current: FixedBuffer::new(buffer_size),
                    next: Some(FixedBuffer::new(buffer_size)),
                    pending: Vec::with_capacity(16),
                }),
                cond: Condvar::new(),
                latch: CountDownLatch::new(1),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Append one log record. Callable from any thread, before or after
    /// [`start`]; records appended before `start` sit in the handoff
    /// buffers until the writer comes up.
    ///
    /// [`start`]: AsyncLogging::start
    pub fn append(&self, record: &[u8]) {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().unwrap();
        let state = &mut *guard;
        if state.current.avail() > record.len() {
            state.current.append(record);
        } else {
            // Current buffer is full: hand it to the writer, promote the
            // spare (or allocate when the producer outruns recycling).
            let next = state
                .next
                .take()
                .unwrap_or_else(|| FixedBuffer::new(inner.buffer_size));
            let full = std::mem::replace(&mut state.current, next);
            state.pending.push(full);
            state.current.append(record);
            inner.cond.notify_one();
        }
    }

    /// Spawn the writer thread; blocks until it runs.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        assert!(
            !inner.running.swap(true, Ordering::SeqCst),
            "AsyncLogging started twice"
        );
        let worker = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(String::from("logging"))
            .spawn(move || write_loop(&worker))
            .expect("failed to spawn the logging thread");
        *inner.writer.lock().unwrap() = Some(handle);
        inner.latch.wait();
    }

    /// Stop the writer, draining everything appended so far.
    pub fn stop(&self) {
        let inner = &*self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.cond.notify_one();
        let handle = inner.writer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn write_loop(inner: &Inner) {
    inner.latch.count_down();

    let mut output = match LogFile::new(inner.basename.clone(), inner.roll_size) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("AsyncLogging cannot open {}: {}", inner.basename, err);
            return;
        }
    };

    let mut spare1 = Some(FixedBuffer::new(inner.buffer_size));
    let mut spare2 = Some(FixedBuffer::new(inner.buffer_size));
    let mut to_write: Vec<FixedBuffer> = Vec::with_capacity(16);

    while inner.running.load(Ordering::SeqCst) {
        debug_assert!(to_write.is_empty());
        {
            let mut state = inner.state.lock().unwrap();
            if state.pending.is_empty() {
                // Deliberately no predicate re-check: waking spuriously
                // or on timeout still flushes whatever is in the current
                // buffer, which is exactly the periodic-flush behavior
                // wanted here.
                let (guard, _) = inner
                    .cond
                    .wait_timeout(state, inner.flush_interval)
                    .unwrap();
                state = guard;
            }
            let current = std::mem::replace(
                &mut state.current,
                spare1.take().unwrap_or_else(|| FixedBuffer::new(inner.buffer_size)),
            );
            state.pending.push(current);
            std::mem::swap(&mut state.pending, &mut to_write);
            if state.next.is_none() {
                state.next = spare2.take();
            }
        }

        if to_write.len() > DROP_THRESHOLD {
            let marker = format!(
                "Dropped log messages at {}, {} larger buffers\n",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                to_write.len() - 2,
            );
            eprint!("{}", marker);
            let _ = output.append(marker.as_bytes());
            to_write.truncate(2);
        }

        for buffer in &to_write {
            if let Err(err) = output.append(&buffer.data) {
                eprintln!("AsyncLogging write failed: {}", err);
            }
        }

        // Recycle two written-out buffers as the next spares.
        if to_write.len() > 2 {
            to_write.truncate(2);
        }
        if spare1.is_none() {
            if let Some(mut buffer) = to_write.pop() {
                buffer.reset();
                spare1 = Some(buffer);
            }
        }
        if spare2.is_none() {
            if let Some(mut buffer) = to_write.pop() {
                buffer.reset();
                spare2 = Some(buffer);
            }
        }
        to_write.clear();
        let _ = output.flush();
    }

    // Final drain so stop() loses nothing that append() accepted.
    let mut state = inner.state.lock().unwrap();
    let current = std::mem::replace(&mut state.current, FixedBuffer::new(0));
    let mut leftover = std::mem::take(&mut state.pending);
    drop(state);
    leftover.push(current);
    for buffer in &leftover {
        if !buffer.data.is_empty() {
            let _ = output.append(&buffer.data);
        }
    }
    let _ = output.flush();
}
