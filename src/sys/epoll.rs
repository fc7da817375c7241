use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP};
use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI};
use libc::EPOLLRDHUP;

use crate::ready::Ready;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: token as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: token as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn ready_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI | EPOLLRDHUP;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Readiness and token of the `idx`-th event.
    ///
    /// EPOLLRDHUP feeds the readable set, not the hang-up set: a peer
    /// half-close must drain pending bytes through the read path before
    /// the close path may run.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<(Ready, usize)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 || (epoll & EPOLLRDHUP) != 0 {
                kind = kind | Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                kind = kind | Ready::writable();
            }

            if (epoll & EPOLLERR) != 0 {
                kind = kind | Ready::error();
            }

            if (epoll & EPOLLHUP) != 0 {
                kind = kind | Ready::hup();
            }

            (kind, event.u64 as usize)
        })
    }
}
