use std::fmt;
use std::ops;

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

/// A set of readiness kinds.
///
/// `readable` and `writable` form the interest mask a channel asks its
/// loop to watch; `error` and `hup` only ever appear in the readiness
/// reported back by the poller.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready(READABLE), "Readable"),
            (Ready(WRITABLE), "Writable"),
            (Ready(ERROR), "Error"),
            (Ready(HUP), "Hup"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn bit_ops() {
        let both = Ready::readable() | Ready::writable();
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_error());

        assert_eq!(both - Ready::readable(), Ready::writable());
        assert_eq!(both & Ready::readable(), Ready::readable());
    }

    #[test]
    fn insert_remove() {
        let mut ready = Ready::empty();
        assert!(ready.is_empty());

        ready.insert(Ready::readable());
        assert!(ready.is_readable());

        ready.remove(Ready::readable());
        assert!(ready.is_empty());
    }
}
