use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` is a set of operation descriptors indicating which operations a
/// registered descriptor is ready to perform. Attaching a descriptor with an
/// empty set is the same as detaching it.
///
/// `Ready` values can be combined together using the various bitwise
/// operators.
///
/// # Examples
///
/// ```
/// use muxio::Ready;
///
/// let ready = Ready::read() | Ready::write();
///
/// assert!(ready.is_read());
/// assert!(ready.is_write());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READ: usize = 0b001;
const WRITE: usize = 0b010;
const EXCEPT: usize = 0b100;
const READY_ALL: usize = READ | WRITE | EXCEPT;

impl Ready {
    /// Returns the empty `Ready` set.
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Returns a `Ready` representing read readiness.
    #[inline]
    pub fn read() -> Ready {
        Ready(READ)
    }

    /// Returns a `Ready` representing write readiness.
    #[inline]
    pub fn write() -> Ready {
        Ready(WRITE)
    }

    /// Returns a `Ready` representing an exceptional condition.
    ///
    /// Exceptional readiness covers socket errors and peer hang-up. It is
    /// delivered even when it was not part of the registered interest.
    #[inline]
    pub fn except() -> Ready {
        Ready(EXCEPT)
    }

    /// Returns true if `Ready` is the empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes read readiness.
    #[inline]
    pub fn is_read(&self) -> bool {
        self.contains(Ready::read())
    }

    /// Returns true if the value includes write readiness.
    #[inline]
    pub fn is_write(&self) -> bool {
        self.contains(Ready::write())
    }

    /// Returns true if the value includes an exceptional condition.
    #[inline]
    pub fn is_except(&self) -> bool {
        self.contains(Ready::except())
    }

    /// Adds all readiness represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all readiness represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    ///
    /// # Examples
    ///
    /// ```
    /// use muxio::Ready;
    ///
    /// let readiness = Ready::read() | Ready::write();
    ///
    /// assert!(readiness.contains(Ready::read()));
    /// assert!(!Ready::read().contains(readiness));
    /// ```
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    /// Returns true if `self` and `other` have any readiness in common.
    #[inline]
    pub fn intersects(&self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(event: usize) -> Ready {
        Ready(event & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::read(), "Read"),
            (Ready::write(), "Write"),
            (Ready::except(), "Except"),
        ];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn bit_ops() {
        let rw = Ready::read() | Ready::write();
        assert!(rw.contains(Ready::read()));
        assert!(rw.contains(Ready::write()));
        assert!(!rw.contains(Ready::except()));

        let r = rw - Ready::write();
        assert_eq!(r, Ready::read());

        assert!((!r).contains(Ready::write()));
        assert!((!r).contains(Ready::except()));
    }

    #[test]
    fn empty_means_detach() {
        let mut set = Ready::read();
        set.remove(Ready::read());
        assert!(set.is_empty());
    }
}
