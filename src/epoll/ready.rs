use std::fmt;
use std::ops::{BitOr, BitOrAssign, BitAnd, Sub};

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

/// A set of readiness event kinds.
///
/// `Ready` is a bitset: `readable() | writable()` observes both read and
/// write readiness on the same registration.
#[derive(Clone, Copy, PartialEq, Eq)]
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

    pub fn is_readable(&self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & HUP != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl Sub for Ready {
    type Output = Ready;

    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        write!(f, "Ready(")?;

        for (flag, name) in &[
            (READABLE, "readable"),
            (WRITABLE, "writable"),
            (ERROR, "error"),
            (HUP, "hup"),
        ] {
            if self.0 & flag != 0 {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }

        if first {
            write!(f, "empty")?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn combine_and_query() {
        let both = Ready::readable() | Ready::writable();
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_error());
        assert!(both.contains(Ready::readable()));
    }

    #[test]
    fn empty_is_empty() {
        assert!(Ready::empty().is_empty());
        assert!(!Ready::readable().is_empty());
    }
}
