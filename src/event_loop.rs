use std::cell::Cell;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::epoll::Events;
use crate::sys::eventfd::EventFd;
use crate::timer_queue::{Timer, TimerId, TimerQueue};

const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_EVENTS: usize = 64;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

static IGNORE_SIGPIPE: Once = Once::new();

// Writes to peer-closed sockets must come back as EPIPE, not kill the
// process. Installed once, at first loop creation.
fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

pub(crate) struct Inner {
    thread: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poller: Poller,
    pub(crate) timers: TimerQueue,
    waker: EventFd,
    wakeup_channel: OnceLock<Arc<Channel>>,
    pending: Mutex<Vec<Task>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if thread::current().id() == self.thread {
            LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}

/// A reactor, at most one per thread.
///
/// The handle is cheap to clone and may be shared freely across
/// threads; only the thread that created the loop may drive [`run`]
/// and touch channels. Everything else funnels through
/// [`run_in_loop`]/[`queue_in_loop`].
///
/// [`run`]: EventLoop::run
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`queue_in_loop`]: EventLoop::queue_in_loop
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        ignore_sigpipe();

        LOOP_IN_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
        });

        let inner = Arc::new(Inner {
            thread: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poller: Poller::new()?,
            timers: TimerQueue::new()?,
            waker: EventFd::new()?,
            wakeup_channel: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
        });

        LOOP_IN_THIS_THREAD.with(|flag| flag.set(true));

        let event_loop = EventLoop { inner };

        let wakeup = Channel::new(&event_loop, event_loop.inner.waker.as_raw_fd());
        let weak = event_loop.downgrade();
        wakeup.set_read_callback(Box::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                EventLoop::from_inner(inner).handle_wakeup();
            }
        }));
        wakeup.enable_reading();
        let _ = event_loop.inner.wakeup_channel.set(wakeup);

        event_loop.inner.timers.install(&event_loop);

        Ok(event_loop)
    }

    /// Drive the reactor until [`quit`](EventLoop::quit).
    ///
    /// Must be called on the thread that created the loop, and only
    /// while not already looping.
    pub fn run(&self) {
        assert!(
            !self.inner.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called while already looping"
        );
        self.assert_in_loop_thread();
        self.inner.quit.store(false, Ordering::SeqCst);
        trace!("EventLoop start looping");

        let mut events = Events::with_capacity(INITIAL_EVENTS);
        let mut active: Vec<Arc<Channel>> = Vec::new();

        while !self.inner.quit.load(Ordering::SeqCst) {
            let receive_time = match self.inner.poller.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(time) => time,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("EventLoop poll failed: {}", e);
                    continue;
                }
            };
            self.inner.iteration.fetch_add(1, Ordering::Relaxed);

            active.clear();
            self.inner.poller.fill_active(&events, &mut active);

            self.inner.event_handling.store(true, Ordering::SeqCst);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.inner.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_tasks();

            if events.len() == events.capacity() {
                events = Events::with_capacity(events.capacity() * 2);
            }
        }

        trace!("EventLoop stop looping");
        self.inner.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to stop after the current iteration. Off-thread
    /// callers additionally wake the poll.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: synchronously when already
    /// there, queued otherwise.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` to run after the current poll iteration's I/O
    /// dispatch.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push(Box::new(task));
        }

        // The loop only looks at the queue once per iteration; wake it
        // unless this enqueue is guaranteed to be seen by the drain of
        // the current iteration.
        if !self.is_in_loop_thread() || self.inner.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Run `cb` at `when`. Safe to call from any thread.
    pub fn run_at<F>(&self, when: Instant, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Timer::new(Box::new(cb), when, None))
    }

    /// Run `cb` once after `delay`. Safe to call from any thread.
    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Run `cb` every `interval`, first in `interval` from now. Safe
    /// to call from any thread.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        assert!(!interval.is_zero());
        self.add_timer(Timer::new(
            Box::new(cb),
            Instant::now() + interval,
            Some(interval),
        ))
    }

    /// Cancel a timer. Honored even from within the timer's own
    /// callback. Safe to call from any thread.
    pub fn cancel(&self, id: TimerId) {
        let inner = self.inner.clone();
        self.run_in_loop(move || inner.timers.cancel(id));
    }

    fn add_timer(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        let inner = self.inner.clone();
        self.run_in_loop(move || inner.timers.add_timer(timer));
        id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop owned by thread {:?} used from thread {:?}",
            self.inner.thread,
            thread::current().id()
        );
    }

    pub fn iteration(&self) -> u64 {
        self.inner.iteration.load(Ordering::Relaxed)
    }

    pub fn event_handling(&self) -> bool {
        self.inner.event_handling.load(Ordering::SeqCst)
    }

    /// Write one event to the wake descriptor, forcing the poll to
    /// return.
    pub fn wakeup(&self) {
        match self.inner.waker.write(1) {
            Ok(()) => (),
            // Counter saturated: a wake is already pending.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => error!("EventLoop::wakeup failed: {}", e),
        }
    }

    fn handle_wakeup(&self) {
        match self.inner.waker.read() {
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => error!("EventLoop wakeup read failed: {}", e),
        }
    }

    // Swap-drain: the critical section is one pointer swap, and a task
    // may queue further tasks without deadlock. Exactly one drain per
    // iteration; tasks queued during the drain run next iteration (the
    // wake in queue_in_loop keeps the loop live).
    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.inner.calling_pending.store(true, Ordering::SeqCst);

        {
            let mut pending = self.inner.pending.lock().unwrap();
            std::mem::swap(&mut tasks, &mut *pending);
        }

        for task in tasks {
            task();
        }
        self.inner.calling_pending.store(false, Ordering::SeqCst);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.inner.poller.update_channel(channel) {
            panic!("update of channel fd = {} failed: {}", channel.fd(), e);
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        if let Err(e) = self.inner.poller.remove_channel(channel) {
            error!("removal of channel fd = {} failed: {}", channel.fd(), e);
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.inner.poller.has_channel(channel)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> EventLoop {
        EventLoop { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.inner.thread)
            .field("looping", &self.inner.looping.load(Ordering::Relaxed))
            .field("iteration", &self.iteration())
            .finish()
    }
}
