use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoopThread, TimerId};

mod util;

use util::init;

// Generous: covers poll slack plus a loaded CI machine.
const SLACK: Duration = Duration::from_millis(150);

#[test]
fn one_shot_fires_close_to_deadline() {
    init();

    let mut worker = EventLoopThread::new("timer-oneshot", None);
    let handle = worker.start().expect("unable to start loop thread");

    let (tx, rx) = mpsc::channel();
    let scheduled = Instant::now();
    let delay = Duration::from_millis(100);
    handle.run_after(delay, move || {
        let _ = tx.send(Instant::now());
    });

    let fired = rx.recv_timeout(Duration::from_secs(2)).expect("timer never fired");
    let elapsed = fired - scheduled;
    assert!(elapsed >= delay, "fired early: {:?}", elapsed);
    assert!(elapsed < delay + SLACK, "fired late: {:?}", elapsed);
}

#[test]
fn timers_fire_in_deadline_order() {
    init();

    let mut worker = EventLoopThread::new("timer-order", None);
    let handle = worker.start().expect("unable to start loop thread");

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let now = Instant::now();
    for (label, delay_ms) in [("late", 80u64), ("early", 20), ("middle", 50)] {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        handle.run_at(now + Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(label);
            let _ = tx.send(());
        });
    }
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
}

#[test]
fn cancel_before_fire_suppresses_the_callback() {
    init();

    let mut worker = EventLoopThread::new("timer-cancel", None);
    let handle = worker.start().expect("unable to start loop thread");

    let fired = Arc::new(AtomicBool::new(false));
    let witness = Arc::clone(&fired);
    let id = handle.run_after(Duration::from_millis(100), move || {
        witness.store(true, Ordering::SeqCst);
    });
    handle.cancel(id);

    thread::sleep(Duration::from_millis(250));
    assert!(!fired.load(Ordering::SeqCst));

    let (tx, rx) = mpsc::channel();
    handle.run_in_loop(move |lp| {
        let _ = tx.send(lp.timer_count());
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
}

#[test]
fn repeating_timer_cancelled_inside_its_own_callback() {
    init();

    let mut worker = EventLoopThread::new("timer-self-cancel", None);
    let handle = worker.start().expect("unable to start loop thread");

    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let witness = Arc::clone(&fired);
    let slot = Arc::clone(&id_slot);
    let canceller = handle.clone();
    let id = handle.run_every(Duration::from_millis(20), move || {
        let count = witness.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 3 {
            let id = slot.lock().unwrap().expect("id published before third firing");
            canceller.cancel(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    // No leak: both timer sets are empty again.
    let (tx, rx) = mpsc::channel();
    handle.run_in_loop(move |lp| {
        let _ = tx.send(lp.timer_count());
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
}
