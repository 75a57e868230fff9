use std::fmt;
use std::ops::BitOr;

/// Readiness interest in an endpoint.
///
/// An endpoint with no interest at all is deregistered from the selector
/// entirely rather than registered with an empty set, so `Interest`
/// itself is always non-empty.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    pub(crate) const READABLE: Interest = Interest(READABLE);
    pub(crate) const WRITABLE: Interest = Interest(WRITABLE);

    pub(crate) const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Combines two boolean wants into an interest, or `None` when the
    /// endpoint should not be watched at all.
    pub(crate) fn from_wants(readable: bool, writable: bool) -> Option<Interest> {
        match (readable, writable) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}
