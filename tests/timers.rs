use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_net::{EventLoopThread, TimerId};

#[test]
fn run_after_fires_in_expiry_order() {
    let loop_thread = EventLoopThread::start("timer-order", None);
    let event_loop = loop_thread.event_loop().clone();

    let (tx, rx) = mpsc::channel();

    let late = tx.clone();
    event_loop.run_after(Duration::from_millis(150), move || {
        late.send(2).unwrap();
    });
    let early = tx;
    event_loop.run_after(Duration::from_millis(50), move || {
        early.send(1).unwrap();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
}

#[test]
fn cancelled_timer_never_fires() {
    let loop_thread = EventLoopThread::start("timer-cancel", None);
    let event_loop = loop_thread.event_loop().clone();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let id = event_loop.run_after(Duration::from_millis(100), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    event_loop.cancel(id);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn periodic_timer_cancelling_itself_fires_exactly_three_times() {
    let loop_thread = EventLoopThread::start("timer-self-cancel", None);
    let event_loop = loop_thread.event_loop().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel();

    let counter = count.clone();
    let slot = id_slot.clone();
    let canceller = event_loop.clone();
    let id = event_loop.run_every(Duration::from_millis(100), move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            let id = slot.lock().unwrap().expect("id stored before first fire");
            canceller.cancel(id);
            tx.send(()).unwrap();
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn periodic_timer_repeats_until_cancelled() {
    let loop_thread = EventLoopThread::start("timer-periodic", None);
    let event_loop = loop_thread.event_loop().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let id = event_loop.run_every(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(500));
    assert!(count.load(Ordering::SeqCst) >= 3);

    event_loop.cancel(id);
    thread::sleep(Duration::from_millis(100));
    let frozen = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), frozen);
}

#[test]
fn tasks_run_on_the_loop_thread_and_may_queue_more() {
    let loop_thread = EventLoopThread::start("loop-tasks", None);
    let event_loop = loop_thread.event_loop().clone();

    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    event_loop.run_in_loop(move || {
        tx1.send(thread::current().name().map(String::from)).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap().as_deref(),
        Some("loop-tasks")
    );

    let (tx, rx) = mpsc::channel();
    let requeue_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        let tx2 = tx.clone();
        requeue_loop.queue_in_loop(move || {
            tx2.send(2).unwrap();
        });
        tx.send(1).unwrap();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
}
