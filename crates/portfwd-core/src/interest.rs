//! Readiness interest as plain state
//!
//! Endpoints record which readiness kinds they want; the reactor translates
//! the difference between wanted and registered sets into registry calls.

use mio::Interest;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const NONE: InterestSet = InterestSet(0);
    pub const READABLE: InterestSet = InterestSet(0b01);
    pub const WRITABLE: InterestSet = InterestSet(0b10);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InterestSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: InterestSet) {
        self.0 &= !other.0;
    }

    /// `None` when empty: mio has no "nothing" interest, the source must be
    /// deregistered instead.
    pub fn to_mio(self) -> Option<Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for InterestSet {
    type Output = InterestSet;

    fn bitor(self, rhs: InterestSet) -> InterestSet {
        InterestSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for InterestSet {
    fn bitor_assign(&mut self, rhs: InterestSet) {
        self.insert(rhs);
    }
}

impl fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READABLE | WRITABLE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}
