use std::fmt::{Display, Formatter};

/// A packet sequence number. These are 32 bit and wrap around, so ordering is defined by
///  serial number arithmetic: `a` is after `b` if going forward from `b` reaches `a` in less
///  than half the number space.
///
/// NB: This is deliberately not `Ord` - serial number comparison is not transitive across the
///      whole number space, so it must not be used as a key in ordered collections
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const INITIAL: SequenceNumber = SequenceNumber(1);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(1))
    }

    /// signed distance from `other` to `self`
    pub fn distance_from(&self, other: SequenceNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub fn is_after(&self, other: SequenceNumber) -> bool {
        self.distance_from(other) > 0
    }

    pub fn is_before(&self, other: SequenceNumber) -> bool {
        self.distance_from(other) < 0
    }

    /// the later of two sequence numbers in serial number order
    pub fn latest(self, other: SequenceNumber) -> SequenceNumber {
        if other.is_after(self) { other } else { self }
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        SequenceNumber(value)
    }
}
