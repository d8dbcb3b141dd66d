//! Sequence numbering for parcels and transport messages.
//!
//! A [`SequenceNumber`] orders objects against other objects from the same
//! source: parcels against parcels travelling the same direction of a route,
//! and transport messages against other messages from the same node link
//! endpoint. The two directions of a route are numbered independently.

use std::fmt;

/// Monotonic 64-bit position of an object within one directed sequence.
///
/// Sequence numbers are assigned once and never reassigned, even when the
/// route carrying them is rewired around a retiring proxy. That property is
/// what lets a receiver merge parcels arriving over an old and a new link
/// into a single ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The first sequence number of any fresh sequence.
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Wraps a raw sequence value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence number immediately after this one.
    ///
    /// Returns `None` on overflow; a sequence that long is unreachable in
    /// practice and treated as a protocol violation by callers.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// This sequence number advanced by `n` positions.
    pub fn checked_add(self, n: u64) -> Option<Self> {
        self.0.checked_add(n).map(Self)
    }

    /// Distance from `base` up to this number, or `None` if this number
    /// precedes `base`.
    pub fn offset_from(self, base: SequenceNumber) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_and_arithmetic() {
        let a = SequenceNumber::new(5);
        let b = a.next().expect("next");
        assert!(a < b);
        assert_eq!(b.value(), 6);
        assert_eq!(b.offset_from(a), Some(1));
        assert_eq!(a.offset_from(b), None);
        assert_eq!(a.checked_add(10), Some(SequenceNumber::new(15)));
    }

    #[test]
    fn test_overflow_is_detected() {
        let max = SequenceNumber::new(u64::MAX);
        assert_eq!(max.next(), None);
        assert_eq!(max.checked_add(1), None);
    }
}
