use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::warn;

use crate::event_loop::{EventLoop, Inner as LoopInner};
use crate::ready::Ready;

pub type ReadCallback = Box<dyn FnMut(Instant) + Send>;
pub type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    New,
    Added,
    Detached,
}

/// Binds one descriptor to its interest set, readiness set and
/// callbacks inside one event loop.
///
/// A channel never owns its descriptor; the owner (connection,
/// acceptor, the loop itself) keeps the descriptor alive for as long
/// as the channel is registered. All interest mutations run on the
/// owning loop's thread.
pub struct Channel {
    fd: RawFd,
    loop_: Weak<LoopInner>,
    self_weak: Weak<Channel>,
    state: Mutex<State>,
}

struct State {
    interest: Ready,
    revents: Ready,
    poller: PollerState,
    token: Option<usize>,
    log_hup: bool,
    event_handling: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            fd,
            loop_: event_loop.downgrade(),
            self_weak: weak.clone(),
            state: Mutex::new(State {
                interest: Ready::empty(),
                revents: Ready::empty(),
                poller: PollerState::New,
                token: None,
                log_hup: true,
                event_handling: false,
                tie: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        self.state.lock().unwrap().read_cb = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.state.lock().unwrap().write_cb = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.state.lock().unwrap().close_cb = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.state.lock().unwrap().error_cb = Some(cb);
    }

    /// Tie this channel to its owner. The weak reference is promoted
    /// to a strong one for the duration of event dispatch so the owner
    /// outlives its own callbacks.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        self.state.lock().unwrap().tie = Some(Arc::downgrade(&owner));
    }

    pub fn set_log_hup(&self, on: bool) {
        self.state.lock().unwrap().log_hup = on;
    }

    pub fn interest(&self) -> Ready {
        self.state.lock().unwrap().interest
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn enable_reading(&self) {
        self.state.lock().unwrap().interest.insert(Ready::readable());
        self.update();
    }

    pub fn disable_reading(&self) {
        self.state.lock().unwrap().interest.remove(Ready::readable());
        self.update();
    }

    pub fn enable_writing(&self) {
        self.state.lock().unwrap().interest.insert(Ready::writable());
        self.update();
    }

    pub fn disable_writing(&self) {
        self.state.lock().unwrap().interest.remove(Ready::writable());
        self.update();
    }

    pub fn disable_all(&self) {
        self.state.lock().unwrap().interest = Ready::empty();
        self.update();
    }

    /// Unregister from the owning loop. The interest set must already
    /// be empty.
    pub fn remove(&self) {
        assert!(self.is_none_interest());
        if let Some(inner) = self.loop_.upgrade() {
            EventLoop::from_inner(inner).remove_channel(self);
        }
    }

    fn update(&self) {
        let this = self.self_weak.upgrade().expect("channel is alive during its own call");
        if let Some(inner) = self.loop_.upgrade() {
            EventLoop::from_inner(inner).update_channel(&this);
        }
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.state.lock().unwrap().revents = revents;
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.state.lock().unwrap().poller
    }

    pub(crate) fn set_poller_state(&self, poller: PollerState) {
        self.state.lock().unwrap().poller = poller;
    }

    pub(crate) fn token(&self) -> Option<usize> {
        self.state.lock().unwrap().token
    }

    pub(crate) fn set_token(&self, token: Option<usize>) {
        self.state.lock().unwrap().token = token;
    }

    /// Dispatch the readiness reported by the poller, in order: close
    /// (hang-up without pending input), error, read, write.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tie = self.state.lock().unwrap().tie.clone();

        match tie {
            Some(tie) => {
                // Owner already gone: the events are stale.
                let _guard = match tie.upgrade() {
                    Some(guard) => guard,
                    None => return,
                };
                self.dispatch(receive_time);
            }
            None => self.dispatch(receive_time),
        }
    }

    fn dispatch(&self, receive_time: Instant) {
        let (revents, log_hup) = {
            let mut state = self.state.lock().unwrap();
            state.event_handling = true;
            (state.revents, state.log_hup)
        };

        if revents.is_hup() && !revents.is_readable() {
            if log_hup {
                warn!("fd = {} hang up", self.fd);
            }
            self.fire_event(|state| &mut state.close_cb);
        }

        if revents.is_error() {
            self.fire_event(|state| &mut state.error_cb);
        }

        if revents.is_readable() {
            self.fire_read(receive_time);
        }

        if revents.is_writable() {
            self.fire_event(|state| &mut state.write_cb);
        }

        self.state.lock().unwrap().event_handling = false;
    }

    // Callbacks are moved out for the duration of the call so they can
    // mutate this channel (disable interest, even remove it) freely.
    fn fire_read(&self, receive_time: Instant) {
        let cb = self.state.lock().unwrap().read_cb.take();
        if let Some(mut cb) = cb {
            cb(receive_time);
            let mut state = self.state.lock().unwrap();
            if state.read_cb.is_none() {
                state.read_cb = Some(cb);
            }
        }
    }

    fn fire_event<F>(&self, field: F)
    where
        F: Fn(&mut State) -> &mut Option<EventCallback>,
    {
        let cb = field(&mut self.state.lock().unwrap()).take();
        if let Some(mut cb) = cb {
            cb();
            let mut state = self.state.lock().unwrap();
            let slot = field(&mut state);
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &state.interest)
            .field("revents", &state.revents)
            .finish()
    }
}
