use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, EventLoopThread, LoopHandle};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn handle_is_send_and_sync() {
    assert_send::<LoopHandle>();
    assert_sync::<LoopHandle>();
}

#[test]
fn cross_thread_queue_delivers_within_one_cycle() {
    init();

    let mut worker = EventLoopThread::new("queue-test", None);
    let handle = worker.start().expect("unable to start loop thread");

    let (tx, rx) = mpsc::channel();
    let posted = Instant::now();
    handle.queue_in_loop(move |lp| {
        lp.assert_in_loop_thread();
        let _ = tx.send(thread::current().id());
    });

    let worker_thread = rx
        .recv_timeout(Duration::from_secs(1))
        .expect("task was not delivered");
    assert_ne!(worker_thread, thread::current().id());
    // Far below the 10 s poll timeout: the waker made the poll return.
    assert!(posted.elapsed() < Duration::from_secs(1));
}

#[test]
fn run_in_loop_is_immediate_on_the_loop_thread() {
    init();

    let mut worker = EventLoopThread::new("immediate-test", None);
    let handle = worker.start().expect("unable to start loop thread");

    let (tx, rx) = mpsc::channel();
    let inner_handle = handle.clone();
    handle.queue_in_loop(move |_| {
        let (inner_tx, inner_rx) = mpsc::channel();
        inner_handle.run_in_loop(move |_| {
            let _ = inner_tx.send(());
        });
        // Had run_in_loop queued instead of running, nothing would be
        // in the channel yet.
        let _ = tx.send(inner_rx.try_recv().is_ok());
    });

    assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
}

#[test]
fn tasks_posted_during_drain_run_next_iteration() {
    init();

    let mut worker = EventLoopThread::new("drain-test", None);
    let handle = worker.start().expect("unable to start loop thread");

    let (tx, rx) = mpsc::channel();
    let inner_handle = handle.clone();
    handle.queue_in_loop(move |lp| {
        let posted_at = lp.iteration();
        inner_handle.queue_in_loop(move |lp| {
            let _ = tx.send((posted_at, lp.iteration()));
        });
    });

    let (first, second) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(second > first);
}

#[test]
fn quit_from_another_thread_interrupts_the_poll() {
    init();

    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let started = Instant::now();
    event_loop.run();
    // Without the wake-up this would sit in poll for the full 10 s.
    assert!(started.elapsed() < Duration::from_secs(5));
    quitter.join().unwrap();
}

#[test]
#[should_panic(expected = "another EventLoop")]
fn second_loop_on_one_thread_panics() {
    let _first = EventLoop::new().expect("unable to create event loop");
    let _second = EventLoop::new();
}
