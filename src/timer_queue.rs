use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::timerfd::TimerFd;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies one scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    when: Instant,
    interval: Option<Duration>,
    cb: TimerCallback,
    id: TimerId,
}

impl Timer {
    pub fn new(cb: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Timer {
            when,
            interval,
            cb,
            id: TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed) + 1),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    fn restart(&mut self, now: Instant) {
        self.when = now + self.interval.expect("only periodic timers restart");
    }
}

/// A best-effort timer queue over one timerfd.
///
/// Two ordered views share the live timers: `timers` keyed by
/// (expiry, id) for expiry scans, `active` keyed by id for
/// cancellation. The sets are only ever touched from the owning
/// loop's thread; cross-thread add/cancel is marshalled by the loop.
pub(crate) struct TimerQueue {
    timerfd: TimerFd,
    channel: OnceLock<Arc<Channel>>,
    state: Mutex<State>,
}

struct State {
    timers: BTreeMap<(Instant, TimerId), Timer>,
    active: BTreeMap<TimerId, Instant>,
    calling_expired: bool,
    cancelled_in_fire: BTreeSet<TimerId>,
}

impl TimerQueue {
    pub fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            timerfd: TimerFd::new()?,
            channel: OnceLock::new(),
            state: Mutex::new(State {
                timers: BTreeMap::new(),
                active: BTreeMap::new(),
                calling_expired: false,
                cancelled_in_fire: BTreeSet::new(),
            }),
        })
    }

    /// Register the timerfd channel in its loop. Called once from
    /// `EventLoop::new` on the owning thread.
    pub fn install(&self, event_loop: &EventLoop) {
        let channel = Channel::new(event_loop, self.timerfd.as_raw_fd());
        let weak = event_loop.downgrade();
        channel.set_read_callback(Box::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.timers.handle_expired();
            }
        }));
        channel.enable_reading();
        let _ = self.channel.set(channel);
    }

    pub fn add_timer(&self, timer: Timer) {
        let mut state = self.state.lock().unwrap();

        let earliest_changed = state
            .timers
            .keys()
            .next()
            .map_or(true, |&(when, _)| timer.when < when);

        state.active.insert(timer.id, timer.when);
        state.timers.insert((timer.when, timer.id), timer);
        debug_assert_eq!(state.timers.len(), state.active.len());

        if earliest_changed {
            let when = state.timers.keys().next().unwrap().0;
            drop(state);
            self.arm(when);
        }
    }

    pub fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock().unwrap();

        if let Some(when) = state.active.remove(&id) {
            let removed = state.timers.remove(&(when, id));
            debug_assert!(removed.is_some());
        } else if state.calling_expired {
            // Mid-fire: keep it from being re-armed.
            state.cancelled_in_fire.insert(id);
        }
        debug_assert_eq!(state.timers.len(), state.active.len());
    }

    fn handle_expired(&self) {
        let _ = self.timerfd.read();
        let now = Instant::now();

        let mut expired: Vec<Timer> = {
            let mut state = self.state.lock().unwrap();

            let remaining = state.timers.split_off(&(now, TimerId(u64::MAX)));
            let due = std::mem::replace(&mut state.timers, remaining);
            let due: Vec<Timer> = due.into_values().collect();

            for timer in &due {
                state.active.remove(&timer.id);
            }
            state.calling_expired = true;
            state.cancelled_in_fire.clear();
            due
        };

        for timer in &mut expired {
            (timer.cb)();
        }

        let mut state = self.state.lock().unwrap();
        state.calling_expired = false;

        for mut timer in expired {
            if timer.interval.is_some() && !state.cancelled_in_fire.contains(&timer.id) {
                timer.restart(now);
                state.active.insert(timer.id, timer.when);
                state.timers.insert((timer.when, timer.id), timer);
            }
        }
        debug_assert_eq!(state.timers.len(), state.active.len());

        if let Some(&(when, _)) = state.timers.keys().next() {
            drop(state);
            self.arm(when);
        }
    }

    fn arm(&self, when: Instant) {
        let delay = when.saturating_duration_since(Instant::now());
        if let Err(e) = self.timerfd.set_delay(delay) {
            error!("timerfd arm failed: {}", e);
        }
    }
}
