use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

/// Runs before a pool loop starts looping, on that loop's thread.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One thread driving one event loop.
pub struct EventLoopThread {
    event_loop: EventLoop,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn the thread, build the loop inside it, and hand the handle
    /// back once the loop is ready to run.
    pub fn start(name: &str, init: Option<ThreadInitCallback>) -> EventLoopThread {
        let (tx, rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let event_loop = EventLoop::new().expect("create event loop");
                if let Some(init) = &init {
                    init(&event_loop);
                }
                tx.send(event_loop.clone()).expect("hand back loop handle");
                event_loop.run();
            })
            .expect("spawn event loop thread");

        let event_loop = rx.recv().expect("event loop thread startup");

        EventLoopThread {
            event_loop,
            thread: Some(thread),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Partitions connections across N loop threads.
///
/// With zero threads the base loop carries everything; otherwise the
/// base loop stays the acceptor's and each new connection is assigned
/// round-robin.
pub struct EventLoopThreadPool {
    base_loop: EventLoop,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoop>,
    next: usize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop: base_loop.clone(),
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                threads: Vec::new(),
                loops: Vec::new(),
                next: 0,
            }),
        }
    }

    pub fn set_thread_num(&self, num: usize) {
        assert!(!self.started.load(Ordering::SeqCst));
        self.num_threads.store(num, Ordering::SeqCst);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) {
        assert!(!self.started.swap(true, Ordering::SeqCst));
        self.base_loop.assert_in_loop_thread();

        let num = self.num_threads.load(Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        for i in 0..num {
            let name = format!("{}{}", self.name, i);
            let thread = EventLoopThread::start(&name, init.clone());
            inner.loops.push(thread.event_loop().clone());
            inner.threads.push(thread);
        }

        if num == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Round-robin assignment; falls back to the base loop when the
    /// pool is empty.
    pub fn get_next_loop(&self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started());

        let mut inner = self.inner.lock().unwrap();
        if inner.loops.is_empty() {
            self.base_loop.clone()
        } else {
            let event_loop = inner.loops[inner.next].clone();
            inner.next = (inner.next + 1) % inner.loops.len();
            event_loop
        }
    }

    /// Deterministic assignment for callers that pin sessions by key.
    pub fn get_loop_for_hash(&self, hash_code: usize) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started());

        let inner = self.inner.lock().unwrap();
        if inner.loops.is_empty() {
            self.base_loop.clone()
        } else {
            inner.loops[hash_code % inner.loops.len()].clone()
        }
    }

    pub fn all_loops(&self) -> Vec<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started());

        let inner = self.inner.lock().unwrap();
        if inner.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            inner.loops.clone()
        }
    }
}
