//! The shared control block between two linked routers.
//!
//! One `RouterLinkState` lives in shared memory for every central link that
//! crosses a node boundary (local links embed one in process memory). Both
//! sides use it to negotiate proxy bypass without a broker round-trip: a
//! side marks itself stable, tries to lock the link before coordinating its
//! own bypass or closure, and leaves behind the name of the node allowed to
//! complete the bypass plus a one-shot key that node must present.
//!
//! The layout is fixed at 64 bytes so the block allocators can hand these
//! out as single fragments. A one-byte spinlock guards the non-atomic
//! cells; holders must not block or take any other lock while holding it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use rand::RngCore;
use weft_core::{LinkSide, NodeName};

/// Status bits tracked per link in [`RouterLinkState`].
pub mod link_status {
    /// Side A holds no decaying links and is not mid-handoff.
    pub const SIDE_A_STABLE: u32 = 1 << 0;
    /// Side B holds no decaying links and is not mid-handoff.
    pub const SIDE_B_STABLE: u32 = 1 << 1;
    /// Both sides stable; the link may be locked.
    pub const STABLE: u32 = SIDE_A_STABLE | SIDE_B_STABLE;
    /// Side A failed to lock because B was unstable and wants a flush once
    /// stability is reached.
    pub const SIDE_A_WAITING: u32 = 1 << 2;
    /// Side B counterpart of [`SIDE_A_WAITING`].
    pub const SIDE_B_WAITING: u32 = 1 << 3;
    /// The link is locked by side A.
    pub const LOCKED_BY_A: u32 = 1 << 4;
    /// The link is locked by side B.
    pub const LOCKED_BY_B: u32 = 1 << 5;
}

/// 128-bit one-shot credential authorizing a proxy bypass.
///
/// Written by a half-proxy into the state it shares with its outward peer,
/// handed to the proxy's successor over the route, and presented back to
/// the outward peer, which consumes it on first validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassKey([u8; 16]);

impl BypassKey {
    /// Generates a fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Reconstructs a key from wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

/// Fixed-layout shared state for one router link. See the module docs.
#[repr(C, align(8))]
pub struct RouterLinkState {
    spinlock: AtomicU8,
    _pad: [u8; 3],
    status: AtomicU32,
    allowed_bypass_source: [UnsafeCell<[u8; 16]>; 2],
    bypass_key: UnsafeCell<[u8; 16]>,
    ref_count: AtomicI32,
    _reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<RouterLinkState>() == 64);

// Shared across nodes by construction; the atomics and the spinlock guard
// every field.
unsafe impl Send for RouterLinkState {}
unsafe impl Sync for RouterLinkState {}

struct CellGuard<'a>(&'a RouterLinkState);

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        self.0.spinlock.store(0, Ordering::Release);
    }
}

impl RouterLinkState {
    /// A state with the given initial status bits and `ref_count` shared
    /// owners.
    pub fn new(initial_status: u32, ref_count: i32) -> Self {
        Self {
            spinlock: AtomicU8::new(0),
            _pad: [0; 3],
            status: AtomicU32::new(initial_status),
            allowed_bypass_source: [UnsafeCell::new([0; 16]), UnsafeCell::new([0; 16])],
            bypass_key: UnsafeCell::new([0; 16]),
            ref_count: AtomicI32::new(ref_count),
            _reserved: [0; 4],
        }
    }

    /// Initializes a state in place inside a shared-memory fragment.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, 8-aligned, and point at 64 writable bytes not
    /// yet visible to any other node.
    pub unsafe fn initialize(ptr: *mut RouterLinkState, ref_count: i32) {
        ptr.write(Self::new(0, ref_count));
    }

    pub(crate) fn ref_count(&self) -> &AtomicI32 {
        &self.ref_count
    }

    fn lock_cells(&self) -> CellGuard<'_> {
        while self
            .spinlock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        CellGuard(self)
    }

    fn stable_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => link_status::SIDE_A_STABLE,
            LinkSide::B => link_status::SIDE_B_STABLE,
        }
    }

    fn waiting_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => link_status::SIDE_A_WAITING,
            LinkSide::B => link_status::SIDE_B_WAITING,
        }
    }

    fn locked_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => link_status::LOCKED_BY_A,
            LinkSide::B => link_status::LOCKED_BY_B,
        }
    }

    /// Marks `side` stable: no decaying links, not mid-handoff.
    pub fn set_side_stable(&self, side: LinkSide) {
        self.status.fetch_or(Self::stable_bit(side), Ordering::AcqRel);
    }

    /// Whether the link is currently locked by `side`.
    pub fn is_locked_by(&self, side: LinkSide) -> bool {
        self.status.load(Ordering::Acquire) & Self::locked_bit(side) != 0
    }

    fn try_lock(&self, side: LinkSide) -> bool {
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status & (link_status::LOCKED_BY_A | link_status::LOCKED_BY_B) != 0 {
                return false;
            }
            if status & link_status::STABLE != link_status::STABLE {
                // Not lockable yet; leave a waiting bit so the other side
                // flushes us when it stabilizes.
                let waiting = Self::waiting_bit(side);
                if status & waiting == 0 {
                    let _ = self.status.compare_exchange(
                        status,
                        status | waiting,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
                return false;
            }
            if self
                .status
                .compare_exchange(
                    status,
                    status | Self::locked_bit(side),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Locks the link from `side` to coordinate that side's bypass,
    /// recording the node allowed to complete it and, when the bypass must
    /// be authenticated, the key that node has to present.
    pub fn try_lock_for_bypass(
        &self,
        side: LinkSide,
        source: NodeName,
        key: Option<BypassKey>,
    ) -> bool {
        if !self.try_lock(side) {
            return false;
        }
        let _guard = self.lock_cells();
        // Guarded by the spinlock held just above.
        unsafe {
            *self.allowed_bypass_source[side.index()].get() = source.to_bytes();
            if let Some(key) = key {
                *self.bypass_key.get() = key.to_bytes();
            }
        }
        true
    }

    /// Locks the link from `side` to propagate that side's closure.
    pub fn try_lock_for_closure(&self, side: LinkSide) -> bool {
        self.try_lock(side)
    }

    /// Releases a lock taken by `side`.
    pub fn unlock(&self, side: LinkSide) {
        self.status
            .fetch_and(!Self::locked_bit(side), Ordering::AcqRel);
    }

    /// If both sides are stable and `side` had set its waiting bit, clears
    /// the bit and returns true: the caller should flush that side's router.
    pub fn reset_waiting_bit(&self, side: LinkSide) -> bool {
        let waiting = Self::waiting_bit(side);
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status & link_status::STABLE != link_status::STABLE {
                return false;
            }
            if status & waiting == 0 {
                return false;
            }
            if self
                .status
                .compare_exchange(
                    status,
                    status & !waiting,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Validates a bypass request arriving at this side's router from
    /// `source`: the other side must hold the lock, must have named
    /// `source` as the allowed requester, and when a key is required the
    /// presented key must match the stored one, which is consumed.
    pub fn validate_bypass_request(
        &self,
        own_side: LinkSide,
        source: NodeName,
        key: Option<&BypassKey>,
    ) -> bool {
        if !self.is_locked_by(own_side.opposite()) {
            return false;
        }
        let _guard = self.lock_cells();
        // Guarded by the spinlock held just above.
        unsafe {
            let allowed =
                NodeName::from_bytes(*self.allowed_bypass_source[own_side.opposite().index()].get());
            if allowed != source {
                return false;
            }
            if let Some(presented) = key {
                let stored = BypassKey::from_bytes(*self.bypass_key.get());
                if stored.is_zero() || stored != *presented {
                    return false;
                }
                *self.bypass_key.get() = [0; 16];
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_requires_both_sides_stable() {
        let state = RouterLinkState::new(0, 1);
        let name = NodeName::new(1, 2);
        assert!(!state.try_lock_for_bypass(LinkSide::A, name, None));

        state.set_side_stable(LinkSide::A);
        assert!(!state.try_lock_for_bypass(LinkSide::A, name, None));

        state.set_side_stable(LinkSide::B);
        assert!(state.try_lock_for_bypass(LinkSide::A, name, None));
        assert!(state.is_locked_by(LinkSide::A));
    }

    #[test]
    fn test_locks_are_mutually_exclusive() {
        let state = RouterLinkState::new(link_status::STABLE, 1);
        assert!(state.try_lock_for_closure(LinkSide::A));
        assert!(!state.try_lock_for_closure(LinkSide::B));
        state.unlock(LinkSide::A);
        assert!(state.try_lock_for_closure(LinkSide::B));
    }

    #[test]
    fn test_waiting_bit_set_and_reset() {
        let state = RouterLinkState::new(link_status::SIDE_A_STABLE, 1);
        assert!(!state.try_lock_for_closure(LinkSide::A));
        // Not yet stable, so the bit stays.
        assert!(!state.reset_waiting_bit(LinkSide::A));

        state.set_side_stable(LinkSide::B);
        assert!(state.reset_waiting_bit(LinkSide::A));
        assert!(!state.reset_waiting_bit(LinkSide::A), "one-shot per set");
    }

    #[test]
    fn test_bypass_validation_checks_source_and_key() {
        let state = RouterLinkState::new(link_status::STABLE, 1);
        let source = NodeName::new(7, 7);
        let other = NodeName::new(8, 8);
        let key = BypassKey::random();

        assert!(state.try_lock_for_bypass(LinkSide::B, source, Some(key)));

        assert!(!state.validate_bypass_request(LinkSide::A, other, Some(&key)));
        let wrong = BypassKey::random();
        assert!(!state.validate_bypass_request(LinkSide::A, source, Some(&wrong)));
        assert!(state.validate_bypass_request(LinkSide::A, source, Some(&key)));
        // The key is consumed on first success.
        assert!(!state.validate_bypass_request(LinkSide::A, source, Some(&key)));
    }

    #[test]
    fn test_validation_requires_peer_lock() {
        let state = RouterLinkState::new(link_status::STABLE, 1);
        let source = NodeName::new(7, 7);
        assert!(!state.validate_bypass_request(LinkSide::A, source, None));
    }
}
