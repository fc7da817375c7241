use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::channel::{Channel, PollerState};
use crate::sys::epoll::{Epoll, Events};

/// Level-triggered epoll poller plus the token → channel registry.
///
/// Only the owning loop's thread calls in here; the event loop asserts
/// that before delegating.
pub(crate) struct Poller {
    epoll: Epoll,
    channels: Mutex<Slab<Arc<Channel>>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            channels: Mutex::new(Slab::new()),
        })
    }

    /// Block until readiness or timeout; returns the wake time handed
    /// to read callbacks as the receive timestamp.
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<Instant> {
        self.epoll.wait(events, timeout)?;
        Ok(Instant::now())
    }

    pub fn fill_active(&self, events: &Events, active: &mut Vec<Arc<Channel>>) {
        let channels = self.channels.lock().unwrap();
        for idx in 0..events.len() {
            if let Some((ready, token)) = events.get(idx) {
                if let Some(channel) = channels.get(token) {
                    channel.set_revents(ready);
                    active.push(channel.clone());
                }
            }
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        let mut channels = self.channels.lock().unwrap();

        match channel.poller_state() {
            PollerState::New => {
                let token = channels.insert(channel.clone());
                channel.set_token(Some(token));
                channel.set_poller_state(PollerState::Added);
                self.epoll.add(channel.fd(), token, channel.interest())
            }
            PollerState::Detached => {
                let token = channel.token().expect("detached channel has a token");
                channel.set_poller_state(PollerState::Added);
                self.epoll.add(channel.fd(), token, channel.interest())
            }
            PollerState::Added => {
                let token = channel.token().expect("added channel has a token");
                if channel.is_none_interest() {
                    channel.set_poller_state(PollerState::Detached);
                    self.epoll.delete(channel.fd())
                } else {
                    self.epoll.modify(channel.fd(), token, channel.interest())
                }
            }
        }
    }

    pub fn remove_channel(&self, channel: &Channel) -> io::Result<()> {
        assert!(channel.is_none_interest());

        let mut channels = self.channels.lock().unwrap();
        if let Some(token) = channel.token() {
            let registered = channels.try_remove(token);
            debug_assert!(registered.is_some());

            if channel.poller_state() == PollerState::Added {
                self.epoll.delete(channel.fd())?;
            }
            channel.set_poller_state(PollerState::New);
            channel.set_token(None);
        }
        Ok(())
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        let channels = self.channels.lock().unwrap();
        channel.token().is_some_and(|token| {
            channels
                .get(token)
                .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), channel))
        })
    }
}
