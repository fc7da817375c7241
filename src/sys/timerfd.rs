use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

const TFD_CLOEXEC: i32 = libc::TFD_CLOEXEC;
const TFD_NONBLOCK: i32 = libc::TFD_NONBLOCK;

/// A one-shot monotonic timer descriptor.
///
/// view: `<http://man7.org/linux/man-pages/man2/timerfd_create.2.html>`
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let flags = TFD_CLOEXEC | TFD_NONBLOCK;
        let timerfd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) },
        })
    }

    /// Arm the timer to expire once after `delay`.
    ///
    /// A zero delay would disarm the descriptor, so it is clamped to
    /// one microsecond.
    pub fn set_delay(&self, delay: Duration) -> io::Result<()> {
        let delay = if delay.is_zero() {
            Duration::from_micros(1)
        } else {
            delay
        };

        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(delay),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        let new_value: libc::itimerspec = unsafe { mem::zeroed() };
        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// Number of expirations since the last read, per read(2) on a
    /// timerfd: an unsigned 8-byte integer in host byte order.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::TimerFd;
    use std::time::Duration;

    #[test]
    fn fires_after_delay() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_delay(Duration::from_millis(10)).unwrap();

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(timerfd.read().unwrap(), 1);
    }

    #[test]
    fn read_before_expiry_would_block() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_delay(Duration::from_secs(60)).unwrap();

        assert!(timerfd.read().is_err());
    }
}
