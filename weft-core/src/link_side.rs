//! Side labels for the two ends of a symmetric link.

use std::fmt;

/// Which end of a two-ended link this is.
///
/// Sides are fixed at link establishment and arbitrate every symmetric
/// choice on the link: which half of the sublink id space each end owns,
/// which status bits in shared link state belong to which end, and which
/// end issues bypass keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSide {
    /// The A side. On a node link, side A belongs to the node with the
    /// greater name.
    A,
    /// The B side.
    B,
}

impl LinkSide {
    /// The side opposite this one.
    pub const fn opposite(self) -> LinkSide {
        match self {
            LinkSide::A => LinkSide::B,
            LinkSide::B => LinkSide::A,
        }
    }

    /// True for [`LinkSide::A`].
    pub const fn is_a(self) -> bool {
        matches!(self, LinkSide::A)
    }

    /// True for [`LinkSide::B`].
    pub const fn is_b(self) -> bool {
        matches!(self, LinkSide::B)
    }

    /// 0 for side A, 1 for side B. Used to index per-side state pairs.
    pub const fn index(self) -> usize {
        match self {
            LinkSide::A => 0,
            LinkSide::B => 1,
        }
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSide::A => write!(f, "A"),
            LinkSide::B => write!(f, "B"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite() {
        assert_eq!(LinkSide::A.opposite(), LinkSide::B);
        assert_eq!(LinkSide::B.opposite(), LinkSide::A);
        assert_eq!(LinkSide::A.opposite().opposite(), LinkSide::A);
    }

    #[test]
    fn test_index_is_disjoint() {
        assert_ne!(LinkSide::A.index(), LinkSide::B.index());
    }
}
