//! Identifier types for nodes, sublinks, and shared buffers.

use std::fmt;

use rand::RngCore;

/// 128-bit identity of a node in the fabric.
///
/// Names are randomly generated at node creation and exchanged during the
/// connection greeting. The numeric ordering of names is load-bearing: when
/// two sides of a connection disagree about a symmetric choice (such as
/// which primary buffer to adopt), the side with the greater name is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeName {
    /// High 64 bits.
    pub first: u64,
    /// Low 64 bits.
    pub second: u64,
}

impl NodeName {
    /// Creates a name from explicit halves.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Generates a fresh random name.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            first: rng.next_u64(),
            second: rng.next_u64(),
        }
    }

    /// Whether this name has been assigned (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }

    /// Fixed-layout little-endian encoding for wire messages and shared
    /// memory.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.first.to_le_bytes());
        out[8..].copy_from_slice(&self.second.to_le_bytes());
        out
    }

    /// Decodes a name previously encoded with [`NodeName::to_bytes`].
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&bytes[..8]);
        second.copy_from_slice(&bytes[8..]);
        Self {
            first: u64::from_le_bytes(first),
            second: u64::from_le_bytes(second),
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Identifies one multiplexed router-to-router channel on a node link.
///
/// Each side of a node link allocates from a disjoint half of the id space
/// (even ids for side A, odd ids for side B), so both sides can mint new
/// sublinks without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SublinkId(pub u64);

impl fmt::Display for SublinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one shared-memory buffer within a node link's memory pool.
///
/// Buffer 0 is always the primary buffer exchanged during connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let name = NodeName::new(0x123456789abcdef0, 0x0fedcba987654321);
        assert_eq!(NodeName::from_bytes(name.to_bytes()), name);
    }

    #[test]
    fn test_name_ordering_matches_halves() {
        let low = NodeName::new(1, u64::MAX);
        let high = NodeName::new(2, 0);
        assert!(low < high);
    }

    #[test]
    fn test_random_names_are_valid_and_distinct() {
        let a = NodeName::random();
        let b = NodeName::random();
        assert!(a.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_name_is_invalid() {
        assert!(!NodeName::default().is_valid());
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        let name = NodeName::new(0x1, 0x2);
        assert_eq!(
            name.to_string(),
            "00000000000000010000000000000002".to_string()
        );
    }
}
