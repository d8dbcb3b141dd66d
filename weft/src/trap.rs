//! Edge-triggered condition monitors on portal status.
//!
//! A trap watches one portal for a set of conditions. It must be *armed*
//! to fire, and arming only succeeds while none of the watched conditions
//! hold; a state change that satisfies a condition fires the handler once
//! and disarms the trap. Handlers run outside every router lock: status
//! changes collect pending events into a [`TrapEventDispatcher`] that
//! fires them when it leaves scope.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::status::PortalStatus;

/// Condition bits a trap may watch.
pub mod trap_conditions {
    /// The peer endpoint closed.
    pub const PEER_CLOSED: u32 = 1 << 0;
    /// The route died.
    pub const DEAD: u32 = 1 << 1;
    /// At least `min_local_parcels` parcels are retrievable.
    pub const LOCAL_PARCELS: u32 = 1 << 2;
    /// At least `min_local_bytes` bytes are retrievable.
    pub const LOCAL_BYTES: u32 = 1 << 3;
    /// A new parcel arrived, regardless of queue depth.
    pub const NEW_LOCAL_PARCEL: u32 = 1 << 4;
}

/// What a trap watches for.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapConditions {
    /// Combination of [`trap_conditions`] bits.
    pub flags: u32,
    /// Threshold for [`trap_conditions::LOCAL_PARCELS`].
    pub min_local_parcels: usize,
    /// Threshold for [`trap_conditions::LOCAL_BYTES`].
    pub min_local_bytes: usize,
}

/// Passed to a trap handler when it fires.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    /// Which watched conditions held at dispatch time.
    pub condition_flags: u32,
    /// Portal status snapshot at dispatch time.
    pub status: PortalStatus,
}

/// A trap's event callback.
pub type TrapHandler = Box<dyn Fn(&TrapEvent) + Send + Sync>;

/// Why the router is reporting a status update to its traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrapUpdateReason {
    NewLocalParcel,
    LocalParcelConsumed,
    PeerClosed,
    StatusQuery,
}

/// Outcome of an arm attempt.
pub(crate) enum ArmOutcome {
    /// Armed; the handler may fire on the next satisfying change.
    Armed,
    /// A watched condition already holds; the satisfied flags and status
    /// are returned instead of arming.
    ConditionsMet(u32, PortalStatus),
}

struct TrapState {
    enabled: bool,
    armed: bool,
    in_flight: usize,
}

/// One registered trap. See the module docs.
pub struct Trap {
    conditions: TrapConditions,
    handler: TrapHandler,
    state: Mutex<TrapState>,
    idle: Condvar,
}

impl Trap {
    pub(crate) fn new(conditions: TrapConditions, handler: TrapHandler) -> Arc<Trap> {
        Arc::new(Trap {
            conditions,
            handler,
            state: Mutex::new(TrapState {
                enabled: true,
                armed: false,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        })
    }

    fn event_flags(&self, status: &PortalStatus, reason: TrapUpdateReason) -> u32 {
        let mut flags = 0;
        if self.conditions.flags & trap_conditions::PEER_CLOSED != 0 && status.is_peer_closed() {
            flags |= trap_conditions::PEER_CLOSED;
        }
        if self.conditions.flags & trap_conditions::DEAD != 0 && status.is_dead() {
            flags |= trap_conditions::DEAD;
        }
        if self.conditions.flags & trap_conditions::LOCAL_PARCELS != 0
            && status.num_local_parcels >= self.conditions.min_local_parcels
        {
            flags |= trap_conditions::LOCAL_PARCELS;
        }
        if self.conditions.flags & trap_conditions::LOCAL_BYTES != 0
            && status.num_local_bytes >= self.conditions.min_local_bytes
        {
            flags |= trap_conditions::LOCAL_BYTES;
        }
        if reason == TrapUpdateReason::NewLocalParcel
            && self.conditions.flags & trap_conditions::NEW_LOCAL_PARCEL != 0
        {
            flags |= trap_conditions::NEW_LOCAL_PARCEL;
        }
        flags
    }

    /// Attempts to arm against the given status. Fails when already armed
    /// or when a watched condition currently holds.
    pub(crate) fn arm_with_status(
        &self,
        status: &PortalStatus,
    ) -> Result<ArmOutcome, crate::PortalError> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(crate::PortalError::InvalidArgument {
                reason: "trap destroyed",
            });
        }
        if state.armed {
            return Err(crate::PortalError::FailedPrecondition {
                reason: "trap already armed",
            });
        }
        let flags = self.event_flags(status, TrapUpdateReason::StatusQuery);
        if flags != 0 {
            return Ok(ArmOutcome::ConditionsMet(flags, *status));
        }
        state.armed = true;
        Ok(ArmOutcome::Armed)
    }

    /// Reports a status change; queues an event on `dispatcher` when armed
    /// and satisfied.
    pub(crate) fn update(
        self: &Arc<Self>,
        status: &PortalStatus,
        reason: TrapUpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        let mut state = self.state.lock();
        if !state.enabled || !state.armed {
            return;
        }
        let flags = self.event_flags(status, reason);
        if flags == 0 {
            return;
        }
        state.armed = false;
        state.in_flight += 1;
        dispatcher.defer(self.clone(), flags, *status);
    }

    /// Permanently prevents further handler invocations.
    pub(crate) fn disable(&self) {
        self.state.lock().enabled = false;
    }

    /// Blocks until no handler invocation is in flight.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.idle.wait(&mut state);
        }
    }

    fn dispatch(&self, flags: u32, status: PortalStatus) {
        let enabled = self.state.lock().enabled;
        if enabled {
            let event = TrapEvent {
                condition_flags: flags,
                status,
            };
            (self.handler)(&event);
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

impl std::fmt::Debug for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Trap")
            .field("conditions", &self.conditions)
            .field("armed", &state.armed)
            .field("enabled", &state.enabled)
            .finish()
    }
}

/// The traps registered on one router.
#[derive(Default)]
pub(crate) struct TrapSet {
    traps: Vec<Arc<Trap>>,
}

impl TrapSet {
    pub fn add(&mut self, trap: Arc<Trap>) {
        self.traps.push(trap);
    }

    pub fn remove(&mut self, trap: &Arc<Trap>) {
        self.traps.retain(|candidate| !Arc::ptr_eq(candidate, trap));
    }

    pub fn update_status(
        &mut self,
        status: &PortalStatus,
        reason: TrapUpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        for trap in &self.traps {
            trap.update(status, reason, dispatcher);
        }
    }

    /// Disables and drops every trap, e.g. on portal closure or transfer.
    pub fn remove_all(&mut self) {
        for trap in self.traps.drain(..) {
            trap.disable();
        }
    }
}

/// Collects trap events while router locks are held and fires them, in
/// order, when dropped, by which point the caller has released every
/// lock.
#[derive(Default)]
pub(crate) struct TrapEventDispatcher {
    events: Vec<(Arc<Trap>, u32, PortalStatus)>,
}

impl TrapEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn defer(&mut self, trap: Arc<Trap>, flags: u32, status: PortalStatus) {
        self.events.push((trap, flags, status));
    }
}

impl Drop for TrapEventDispatcher {
    fn drop(&mut self) {
        for (trap, flags, status) in self.events.drain(..) {
            trap.dispatch(flags, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_trap(conditions: TrapConditions) -> (Arc<Trap>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let trap = Trap::new(
            conditions,
            Box::new(move |_event| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (trap, count)
    }

    #[test]
    fn test_arm_fails_when_condition_already_met() {
        let (trap, _) = counting_trap(TrapConditions {
            flags: trap_conditions::LOCAL_PARCELS,
            min_local_parcels: 1,
            min_local_bytes: 0,
        });
        let status = PortalStatus {
            num_local_parcels: 1,
            ..PortalStatus::default()
        };
        match trap.arm_with_status(&status).expect("arm runs") {
            ArmOutcome::ConditionsMet(flags, _) => {
                assert_ne!(flags & trap_conditions::LOCAL_PARCELS, 0);
            }
            ArmOutcome::Armed => panic!("should not arm"),
        }
    }

    #[test]
    fn test_fires_once_per_arm() {
        let (trap, count) = counting_trap(TrapConditions {
            flags: trap_conditions::LOCAL_PARCELS,
            min_local_parcels: 1,
            min_local_bytes: 0,
        });
        let empty = PortalStatus::default();
        assert!(matches!(
            trap.arm_with_status(&empty),
            Ok(ArmOutcome::Armed)
        ));

        let one = PortalStatus {
            num_local_parcels: 1,
            ..PortalStatus::default()
        };
        {
            let mut dispatcher = TrapEventDispatcher::new();
            trap.update(&one, TrapUpdateReason::NewLocalParcel, &mut dispatcher);
            // Second update while disarmed does nothing.
            trap.update(&one, TrapUpdateReason::NewLocalParcel, &mut dispatcher);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Re-arming while the condition still holds fails.
        assert!(trap.arm_with_status(&one).is_err() || {
            matches!(
                trap.arm_with_status(&one),
                Ok(ArmOutcome::ConditionsMet(..))
            )
        });
    }

    #[test]
    fn test_double_arm_is_failed_precondition() {
        let (trap, _) = counting_trap(TrapConditions {
            flags: trap_conditions::PEER_CLOSED,
            ..TrapConditions::default()
        });
        let status = PortalStatus::default();
        assert!(matches!(
            trap.arm_with_status(&status),
            Ok(ArmOutcome::Armed)
        ));
        assert!(matches!(
            trap.arm_with_status(&status),
            Err(crate::PortalError::FailedPrecondition { .. })
        ));
    }

    #[test]
    fn test_disabled_trap_never_fires() {
        let (trap, count) = counting_trap(TrapConditions {
            flags: trap_conditions::NEW_LOCAL_PARCEL,
            ..TrapConditions::default()
        });
        let status = PortalStatus::default();
        assert!(matches!(
            trap.arm_with_status(&status),
            Ok(ArmOutcome::Armed)
        ));
        {
            let mut dispatcher = TrapEventDispatcher::new();
            trap.update(&status, TrapUpdateReason::NewLocalParcel, &mut dispatcher);
            trap.disable();
        }
        // The event was queued before disable, but dispatch re-checks.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        trap.wait_idle();
    }
}
