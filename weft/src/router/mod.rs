//! The per-endpoint routing state machine.
//!
//! A router is the in-process object behind one portal. Every route
//! stabilizes toward exactly two interconnected terminal routers; when a
//! portal moves, the route is extended with a new terminal router at the
//! destination and the old one remains behind as a proxy, to be bypassed
//! and retired by the protocol implemented here.
//!
//! All mutable state sits behind a single non-reentrant mutex. Work that
//! reaches other routers or the wire is collected under the lock and
//! performed after it is released; the only cross-router lock acquisition
//! is explicitly ordered by address to keep the lock graph acyclic.

pub mod descriptor;
mod edge;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use weft_core::{DriverHandle, LinkSide, NodeName, SequenceNumber, SublinkId};

use crate::link::local::{LocalLinkInitialState, LocalRouterLink};
use crate::link::remote::RemoteRouterLink;
use crate::link::state::BypassKey;
use crate::link::{LinkType, RouterLink};
use crate::node::link::NodeLink;
use crate::parcel::Parcel;
use crate::sequenced_queue::SequencedQueue;
use crate::status::{status_flags, Limits, PortalStatus};
use crate::trap::{
    ArmOutcome, Trap, TrapConditions, TrapEventDispatcher, TrapHandler, TrapSet,
    TrapUpdateReason,
};
use crate::PortalError;
use descriptor::RouterDescriptor;
use edge::RouteEdge;

/// What role a router currently plays on its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// A terminal router held by the application.
    Active,
    /// A terminal router whose outward link is not wired up yet.
    Buffering,
    /// Forwards parcels in both directions.
    Proxy,
    /// Forwards in a bounded window only; bypass-ready.
    HalfProxy,
    /// Closed or fully retired.
    Dead,
}

struct RouterState {
    side: LinkSide,
    mode: RoutingMode,
    status: PortalStatus,
    traps: TrapSet,
    outward: RouteEdge,
    inward: Option<RouteEdge>,
    bridge: Option<Box<RouteEdge>>,
    outbound: SequencedQueue<Parcel>,
    inbound: SequencedQueue<Parcel>,
    pending_put: Option<Vec<u8>>,
    pending_get: bool,
}

impl RouterState {
    fn recompute_mode(&mut self) {
        let inward_empty = self
            .inward
            .as_ref()
            .is_some_and(|edge| edge.primary().is_none() && edge.decaying().is_none());
        self.mode = if self.inbound.is_dead() && self.outbound.is_dead() {
            RoutingMode::Dead
        } else if self.inward.is_some() {
            if inward_empty && self.outward.primary().is_none() && self.outward.decaying().is_none()
            {
                RoutingMode::Dead
            } else if self.outward.is_stable()
                && self.inward.as_ref().is_some_and(RouteEdge::is_stable)
            {
                RoutingMode::Proxy
            } else {
                RoutingMode::HalfProxy
            }
        } else if self.outward.primary().is_none() {
            RoutingMode::Buffering
        } else {
            RoutingMode::Active
        };
    }

    fn refresh_local_counts(&mut self) {
        self.status.num_local_parcels = self.inbound.num_available();
        self.status.num_local_bytes = self.inbound.total_available_size();
    }
}

/// The state machine behind one portal (or one proxying hop).
pub struct Router {
    state: Mutex<RouterState>,
}

fn lock_two<'a>(
    first: &'a Router,
    second: &'a Router,
) -> (MutexGuard<'a, RouterState>, MutexGuard<'a, RouterState>) {
    let first_addr = first as *const Router as usize;
    let second_addr = second as *const Router as usize;
    debug_assert_ne!(first_addr, second_addr);
    if first_addr < second_addr {
        let a = first.state.lock();
        let b = second.state.lock();
        (a, b)
    } else {
        let b = second.state.lock();
        let a = first.state.lock();
        (a, b)
    }
}

fn lock_many<'a>(routers: &[&'a Router]) -> Vec<MutexGuard<'a, RouterState>> {
    let mut order: Vec<usize> = (0..routers.len()).collect();
    order.sort_by_key(|&i| routers[i] as *const Router as usize);
    let mut slots: Vec<Option<MutexGuard<'a, RouterState>>> =
        routers.iter().map(|_| None).collect();
    for &i in &order {
        slots[i] = Some(routers[i].state.lock());
    }
    slots
        .into_iter()
        .map(|slot| match slot {
            Some(guard) => guard,
            None => unreachable!("every router was locked"),
        })
        .collect()
}

impl Router {
    fn new(side: LinkSide) -> Arc<Router> {
        Arc::new(Router {
            state: Mutex::new(RouterState {
                side,
                mode: RoutingMode::Buffering,
                status: PortalStatus::default(),
                traps: TrapSet::default(),
                outward: RouteEdge::new(),
                inward: None,
                bridge: None,
                outbound: SequencedQueue::new(),
                inbound: SequencedQueue::new(),
                pending_put: None,
                pending_get: false,
            }),
        })
    }

    /// A connected pair of terminal routers on one node.
    pub(crate) fn new_pair() -> (Arc<Router>, Arc<Router>) {
        let first = Router::new(LinkSide::A);
        let second = Router::new(LinkSide::B);
        let (link_a, link_b) = LocalRouterLink::new_pair(
            LinkType::Central,
            LocalLinkInitialState::CanBypass,
            first.clone(),
            second.clone(),
        );
        {
            let mut state = first.state.lock();
            state.outward.set_primary_link(link_a);
            state.mode = RoutingMode::Active;
        }
        {
            let mut state = second.state.lock();
            state.outward.set_primary_link(link_b);
            state.mode = RoutingMode::Active;
        }
        (first, second)
    }

    /// A terminal router waiting for its outward link, e.g. an initial
    /// portal created before its connection finishes.
    pub(crate) fn new_buffering(side: LinkSide) -> Arc<Router> {
        Router::new(side)
    }

    /// The router's current routing mode.
    pub fn routing_mode(&self) -> RoutingMode {
        self.state.lock().mode
    }

    /// Pins the router's route side once the connection greeting decides
    /// it.
    pub(crate) fn set_side(&self, side: LinkSide) {
        self.state.lock().side = side;
    }

    /// Whether the other end of the route is known to be closed.
    pub fn is_peer_closed(&self) -> bool {
        self.state.lock().status.is_peer_closed()
    }

    /// Whether the route is closed and fully drained.
    pub fn is_route_dead(&self) -> bool {
        self.state.lock().status.is_dead()
    }

    /// Snapshot of the portal-visible status.
    pub fn query_status(&self) -> PortalStatus {
        let mut state = self.state.lock();
        state.refresh_local_counts();
        state.status
    }

    /// Whether this router's outward link goes directly to `other` in this
    /// process.
    pub fn has_local_peer(&self, other: &Arc<Router>) -> bool {
        self.state
            .lock()
            .outward
            .local_peer()
            .is_some_and(|peer| Arc::ptr_eq(&peer, other))
    }

    pub(crate) fn would_outbound_parcel_exceed_limits(
        &self,
        data_size: usize,
        limits: &Limits,
    ) -> bool {
        let link = {
            let state = self.state.lock();
            if state.outbound.num_available() >= limits.max_queued_parcels {
                return true;
            }
            let queued = state.outbound.total_available_size();
            if queued > limits.max_queued_bytes
                || data_size > limits.max_queued_bytes - queued
            {
                return true;
            }
            match state.outward.primary() {
                Some(link) => link.clone(),
                None => return false,
            }
        };
        link.would_parcel_exceed_limits(data_size, limits)
    }

    pub(crate) fn would_inbound_parcel_exceed_limits(
        &self,
        data_size: usize,
        limits: &Limits,
    ) -> bool {
        let state = self.state.lock();
        let queued = state.inbound.total_available_size();
        queued > limits.max_queued_bytes
            || data_size > limits.max_queued_bytes - queued
            || state.inbound.num_available() >= limits.max_queued_parcels
    }

    /// Sends one parcel from this terminal router toward the peer.
    pub(crate) fn send(
        self: &Arc<Self>,
        parcel: Parcel,
        limits: Option<&Limits>,
    ) -> Result<(), PortalError> {
        if let Some(limits) = limits {
            if self.would_outbound_parcel_exceed_limits(parcel.data_len(), limits) {
                return Err(PortalError::ResourceExhausted);
            }
        }

        let mut slot = Some(parcel);
        let mut rejected: Option<Parcel> = None;
        let fast_link = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            debug_assert!(state.inward.is_none());
            if state.status.is_peer_closed() {
                rejected = slot.take();
                None
            } else if state.outbound.final_length().is_some() {
                rejected = slot.take();
                None
            } else {
                let n = state.outbound.current_sequence_length();
                if let Some(parcel) = slot.as_mut() {
                    parcel.set_sequence_number(n);
                }
                let link = if state.outbound.is_empty() {
                    state.outward.link_for_transmission(n)
                } else {
                    None
                };
                match (&link, n.next()) {
                    (Some(_), Some(next)) => state.outbound.reset_base(next),
                    _ => {
                        if let Some(parcel) = slot.take() {
                            if let Err(parcel) = state.outbound.push(n, parcel) {
                                rejected = Some(parcel);
                            }
                        }
                    }
                }
                link
            }
        };

        if rejected.is_some() {
            drop(rejected);
            return Err(PortalError::NotFound);
        }
        match (fast_link, slot.take()) {
            (Some(link), Some(parcel)) => link.accept_parcel(parcel),
            _ => self.flush(false),
        }
        Ok(())
    }

    /// Closes this side of the route. Idempotent.
    pub fn close_route(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.traps.remove_all();
            let length = state.outbound.current_sequence_length();
            let _ = state.outbound.set_final_length(length);
            state.pending_put = None;
            state.pending_get = false;
        }
        self.flush(false);
    }

    /// Bridges this route with `other`'s route. Both routers must be fresh
    /// terminal routers.
    pub(crate) fn merge_route(self: &Arc<Self>, other: &Arc<Router>) -> Result<(), PortalError> {
        if Arc::ptr_eq(self, other) {
            return Err(PortalError::InvalidArgument {
                reason: "cannot merge a portal with itself",
            });
        }
        if self.has_local_peer(other) {
            return Err(PortalError::InvalidArgument {
                reason: "cannot merge a portal with its own peer",
            });
        }
        {
            let (mut a, mut b) = lock_two(self, other);
            if a.inward.is_some() || b.inward.is_some() || a.bridge.is_some() || b.bridge.is_some()
            {
                return Err(PortalError::InvalidArgument {
                    reason: "merge requires terminal routers",
                });
            }
            if a.inbound.current_sequence_number() != SequenceNumber::ZERO
                || a.outbound.current_sequence_length() != SequenceNumber::ZERO
                || b.inbound.current_sequence_number() != SequenceNumber::ZERO
                || b.outbound.current_sequence_length() != SequenceNumber::ZERO
            {
                return Err(PortalError::FailedPrecondition {
                    reason: "merge requires unused portals",
                });
            }

            let (link_a, link_b) = LocalRouterLink::new_pair(
                LinkType::Bridge,
                LocalLinkInitialState::CannotBypass,
                self.clone(),
                other.clone(),
            );
            let mut bridge_a = Box::new(RouteEdge::new());
            bridge_a.set_primary_link(link_a);
            a.bridge = Some(bridge_a);
            let mut bridge_b = Box::new(RouteEdge::new());
            bridge_b.set_primary_link(link_b);
            b.bridge = Some(bridge_b);
        }
        self.flush(false);
        other.flush(false);
        Ok(())
    }

    /// Installs this router's outward link. Only valid while it has none.
    pub(crate) fn set_outward_link(self: &Arc<Self>, link: Arc<dyn RouterLink>) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let is_central = link.link_type().is_central();
            state.outward.set_primary_link(link.clone());
            if is_central
                && state.outward.is_stable()
                && state.inward.as_ref().map_or(true, RouteEdge::is_stable)
            {
                link.mark_side_stable();
            }
        }
        self.flush(true);
    }

    /// A parcel travelling toward this side's endpoint.
    pub(crate) fn accept_inbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut rejected = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let n = parcel.sequence_number();
            match state.inbound.push(n, parcel) {
                Err(parcel) => rejected = Some(parcel),
                Ok(()) => {
                    if state.inward.is_none() {
                        state.refresh_local_counts();
                        let status = state.status;
                        state.traps.update_status(
                            &status,
                            TrapUpdateReason::NewLocalParcel,
                            &mut dispatcher,
                        );
                    }
                }
            }
        }
        if rejected.is_some() {
            // Duplicate or out-of-window delivery; attachments close with
            // the parcel, outside the lock.
            drop(rejected);
            return true;
        }
        self.flush(false);
        true
    }

    /// A parcel travelling away from this side's endpoint, to be forwarded
    /// outward.
    pub(crate) fn accept_outbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        let mut rejected = None;
        {
            let mut state = self.state.lock();
            let n = parcel.sequence_number();
            if let Err(parcel) = state.outbound.push(n, parcel) {
                rejected = Some(parcel);
            }
        }
        if rejected.is_some() {
            drop(rejected);
            return false;
        }
        self.flush(false);
        true
    }

    /// The route endpoint beyond `link_type` closed at `sequence_length`.
    pub(crate) fn accept_route_closure(
        self: &Arc<Self>,
        link_type: LinkType,
        sequence_length: SequenceNumber,
    ) {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match link_type {
                LinkType::Central | LinkType::PeripheralOutward => {
                    if !state.inbound.set_final_length(sequence_length) {
                        tracing::warn!(
                            %sequence_length,
                            "ignoring inconsistent route closure"
                        );
                        return;
                    }
                    if state.inward.is_none() && state.bridge.is_none() {
                        state.status.flags |= status_flags::PEER_CLOSED;
                        if state.inbound.is_dead() {
                            state.status.flags |= status_flags::DEAD;
                        }
                        state.refresh_local_counts();
                        let status = state.status;
                        state.traps.update_status(
                            &status,
                            TrapUpdateReason::PeerClosed,
                            &mut dispatcher,
                        );
                    }
                }
                LinkType::Bridge => {
                    if !state.outbound.set_final_length(sequence_length) {
                        return;
                    }
                    state.bridge = None;
                }
                LinkType::PeripheralInward => {
                    tracing::warn!("route closure arrived on an inward link");
                    return;
                }
            }
        }
        self.flush(false);
    }

    /// The route broke somewhere beyond `link_type`.
    pub(crate) fn accept_route_disconnection(self: &Arc<Self>, link_type: LinkType) {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut forward: Vec<Arc<dyn RouterLink>> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if link_type.is_peripheral_inward() {
                forward.extend(state.outward.release_primary_link());
                forward.extend(state.outward.release_decaying_link());
            } else if let Some(inward) = state.inward.as_mut() {
                forward.extend(inward.release_primary_link());
                forward.extend(inward.release_decaying_link());
            } else if let Some(bridge) = state.bridge.as_mut() {
                forward.extend(bridge.release_primary_link());
                forward.extend(bridge.release_decaying_link());
            } else {
                state.status.flags |= status_flags::PEER_CLOSED;
                if state.inbound.final_length().is_none() {
                    // The sequence ends wherever it ends; anything beyond
                    // is reported lost via the dead bit.
                    let _ = state
                        .inbound
                        .set_final_length(state.inbound.current_sequence_length());
                }
                if state.inbound.is_dead() {
                    state.status.flags |= status_flags::DEAD;
                }
                state.refresh_local_counts();
                let status = state.status;
                state
                    .traps
                    .update_status(&status, TrapUpdateReason::PeerClosed, &mut dispatcher);
            }
        }
        for link in forward {
            link.accept_route_disconnection();
        }
        self.flush(false);
    }

    /// Pops the next retrievable parcel.
    pub(crate) fn get_next_parcel(&self) -> Result<Parcel, PortalError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inward.is_some() {
            return Err(PortalError::InvalidArgument {
                reason: "not a terminal router",
            });
        }
        if state.pending_get {
            return Err(PortalError::AlreadyExists);
        }
        if !state.inbound.has_next() {
            if state.inbound.is_dead() {
                return Err(PortalError::NotFound);
            }
            return Err(PortalError::Unavailable);
        }
        let parcel = match state.inbound.pop() {
            Some(parcel) => parcel,
            None => return Err(PortalError::Unavailable),
        };
        state.refresh_local_counts();
        if state.inbound.is_dead() {
            state.status.flags |= status_flags::DEAD;
        }
        let status = state.status;
        state.traps.update_status(
            &status,
            TrapUpdateReason::LocalParcelConsumed,
            &mut dispatcher,
        );
        Ok(parcel)
    }

    /// Reserves a writable span for a two-phase put.
    pub(crate) fn begin_put(&self, num_bytes: usize) -> Result<(), PortalError> {
        let mut state = self.state.lock();
        if state.pending_put.is_some() {
            return Err(PortalError::AlreadyExists);
        }
        if state.status.is_peer_closed() {
            return Err(PortalError::NotFound);
        }
        state.pending_put = Some(vec![0u8; num_bytes]);
        Ok(())
    }

    /// Runs `f` over the reserved span.
    pub(crate) fn with_put_span<R>(
        &self,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PortalError> {
        let mut state = self.state.lock();
        match state.pending_put.as_mut() {
            Some(span) => Ok(f(span)),
            None => Err(PortalError::FailedPrecondition {
                reason: "no put in progress",
            }),
        }
    }

    /// Publishes the reserved span at the next outbound sequence number.
    pub(crate) fn commit_put(
        self: &Arc<Self>,
        num_bytes_produced: usize,
        routers: Vec<Arc<Router>>,
        handles: Vec<DriverHandle>,
    ) -> Result<(), PortalError> {
        let mut span = {
            let mut state = self.state.lock();
            match state.pending_put.take() {
                Some(span) => span,
                None => {
                    return Err(PortalError::FailedPrecondition {
                        reason: "no put in progress",
                    })
                }
            }
        };
        if num_bytes_produced > span.len() {
            self.state.lock().pending_put = Some(span);
            return Err(PortalError::InvalidArgument {
                reason: "produced more than the reserved span",
            });
        }
        span.truncate(num_bytes_produced);
        let parcel = Parcel::with_attachments(Bytes::from(span), routers, handles);
        self.send(parcel, None)
    }

    /// Releases a reserved span without sending anything.
    pub(crate) fn abort_put(&self) -> Result<(), PortalError> {
        let mut state = self.state.lock();
        match state.pending_put.take() {
            Some(_) => Ok(()),
            None => Err(PortalError::FailedPrecondition {
                reason: "no put in progress",
            }),
        }
    }

    /// Starts a two-phase get over the next parcel, exposing its data.
    pub(crate) fn begin_get(&self) -> Result<(Bytes, usize, usize), PortalError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inward.is_some() {
            return Err(PortalError::InvalidArgument {
                reason: "not a terminal router",
            });
        }
        if state.pending_get {
            return Err(PortalError::AlreadyExists);
        }
        if !state.inbound.has_next() {
            if state.inbound.is_dead() {
                return Err(PortalError::NotFound);
            }
            return Err(PortalError::Unavailable);
        }
        let parcel = match state.inbound.next_mut() {
            Some(parcel) => parcel,
            None => return Err(PortalError::Unavailable),
        };
        let view = (parcel.data_bytes(), parcel.num_routers(), parcel.num_handles());
        state.pending_get = true;
        Ok(view)
    }

    /// Consumes `num_bytes` of the parcel under a two-phase get. Returns
    /// the popped parcel once its data is fully consumed.
    pub(crate) fn commit_get(&self, num_bytes: usize) -> Result<Option<Parcel>, PortalError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.pending_get {
            return Err(PortalError::FailedPrecondition {
                reason: "no get in progress",
            });
        }
        state.pending_get = false;
        let Some(parcel) = state.inbound.next_mut() else {
            return Err(PortalError::FailedPrecondition {
                reason: "parcel vanished mid-get",
            });
        };
        if num_bytes > parcel.data_len() {
            return Err(PortalError::InvalidArgument {
                reason: "consumed more than available",
            });
        }
        parcel.consume(num_bytes);
        let drained = parcel.data_len() == 0;
        state.inbound.reduce_next_size(num_bytes);
        let popped = if drained { state.inbound.pop() } else { None };

        state.refresh_local_counts();
        if state.inbound.is_dead() {
            state.status.flags |= status_flags::DEAD;
        }
        let status = state.status;
        state.traps.update_status(
            &status,
            TrapUpdateReason::LocalParcelConsumed,
            &mut dispatcher,
        );
        Ok(popped)
    }

    /// Abandons a two-phase get without observable effect.
    pub(crate) fn abort_get(&self) -> Result<(), PortalError> {
        let mut state = self.state.lock();
        if !state.pending_get {
            return Err(PortalError::FailedPrecondition {
                reason: "no get in progress",
            });
        }
        state.pending_get = false;
        Ok(())
    }

    /// Registers a trap watching this router.
    pub(crate) fn create_trap(&self, conditions: TrapConditions, handler: TrapHandler) -> Arc<Trap> {
        let trap = Trap::new(conditions, handler);
        self.state.lock().traps.add(trap.clone());
        trap
    }

    /// Arms a trap against the current status.
    pub(crate) fn arm_trap(&self, trap: &Arc<Trap>) -> Result<(), PortalError> {
        let mut state = self.state.lock();
        state.refresh_local_counts();
        match trap.arm_with_status(&state.status)? {
            ArmOutcome::Armed => Ok(()),
            ArmOutcome::ConditionsMet(_, _) => Err(PortalError::FailedPrecondition {
                reason: "trap conditions already met",
            }),
        }
    }

    /// Unregisters and disables a trap; with `blocking`, waits for any
    /// in-flight handler invocation to return first.
    pub(crate) fn destroy_trap(&self, trap: &Arc<Trap>, blocking: bool) {
        self.state.lock().traps.remove(trap);
        trap.disable();
        if blocking {
            trap.wait_idle();
        }
    }

    // =========================================================================
    // Serialization across nodes
    // =========================================================================

    /// Prepares this router to move to `node_link`'s remote node, emitting
    /// the descriptor the new router is built from. The caller must call
    /// [`Router::begin_proxying_to_new_router`] once the descriptor is on
    /// the wire.
    pub(crate) fn serialize_new_router(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
    ) -> RouterDescriptor {
        let key = BypassKey::random();
        let (local_peer, initiate_bypass) = {
            let mut state = self.state.lock();
            state.traps.remove_all();
            let local_peer = state.outward.local_peer();
            let initiate_bypass = state
                .outward
                .try_lock_primary_for_bypass(node_link.remote_name(), Some(key));
            (local_peer, initiate_bypass)
        };

        if initiate_bypass {
            if let Some(local_peer) = local_peer {
                if let Some(descriptor) =
                    self.serialize_with_local_peer(node_link, &local_peer)
                {
                    return descriptor;
                }
            }
        }
        self.serialize_and_configure_proxy(node_link, initiate_bypass, key)
    }

    /// Fast path: this router's peer is local, so the new remote router
    /// links straight to that peer and this router only lingers to forward
    /// what is already in flight.
    fn serialize_with_local_peer(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
        local_peer: &Arc<Router>,
    ) -> Option<RouterDescriptor> {
        let decaying_inbound_length;
        {
            let (mut own, mut peer) = lock_two(self, local_peer);
            let still_linked = peer
                .outward
                .local_peer()
                .is_some_and(|candidate| Arc::ptr_eq(&candidate, self));
            if !still_linked {
                // The peer closed; its link to us is already gone.
                drop(own);
                return None;
            }
            decaying_inbound_length = peer.outbound.current_sequence_number();
            peer.outward.release_primary_link();
        }

        let new_sublink = node_link.allocate_sublink();
        let decaying_sublink = node_link.allocate_sublink();
        let link_state = node_link.memory().allocate_router_link_state();
        let (state_for_link, carried_state) = match link_state {
            Some(state) => {
                let carried = state.clone_ref();
                (Some(state), carried)
            }
            None => (None, None),
        };

        // The central link binds the still-local peer to the new remote
        // router; the extra sublink is a decaying inward link for whatever
        // this router still holds. Neither is adopted by a router until
        // the descriptor is transmitted.
        let new_link = node_link.add_remote_router_link(
            new_sublink,
            state_for_link,
            LinkType::Central,
            LinkSide::A,
            local_peer.clone(),
        );
        new_link.mark_side_stable();
        node_link.add_remote_router_link(
            decaying_sublink,
            None,
            LinkType::PeripheralInward,
            LinkSide::A,
            self.clone(),
        );

        let mut descriptor = RouterDescriptor {
            new_sublink,
            new_decaying_sublink: decaying_sublink,
            proxy_already_bypassed: true,
            ..RouterDescriptor::default()
        };
        if let Some(carried) = carried_state {
            descriptor.new_link_state = carried.release();
        }

        let (mut own, _peer) = lock_two(self, local_peer);
        descriptor.side = own.side;
        descriptor.next_outgoing_sequence_number = own.outbound.current_sequence_number();
        descriptor.next_incoming_sequence_number = own.inbound.current_sequence_number();
        descriptor.decaying_incoming_sequence_length = decaying_inbound_length;
        if let Some(final_length) = own.inbound.final_length() {
            descriptor.peer_closed = true;
            descriptor.closed_peer_sequence_length = final_length;
        }

        let mut inward = RouteEdge::new();
        inward.start_decaying(
            Some(decaying_inbound_length),
            Some(own.outbound.current_sequence_number()),
        );
        own.inward = Some(inward);
        own.recompute_mode();
        Some(descriptor)
    }

    /// General path: this router stays behind as a proxy for the new
    /// remote router.
    fn serialize_and_configure_proxy(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
        initiate_bypass: bool,
        key: BypassKey,
    ) -> RouterDescriptor {
        let mut descriptor = RouterDescriptor::default();
        let new_sublink = node_link.allocate_sublink();
        descriptor.new_sublink = new_sublink;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            descriptor.side = state.side;
            descriptor.next_outgoing_sequence_number = state.outbound.current_sequence_number();
            descriptor.next_incoming_sequence_number = state.inbound.current_sequence_number();

            let mut inward = RouteEdge::new();
            if state.status.is_peer_closed() {
                descriptor.peer_closed = true;
                let final_length = state
                    .inbound
                    .final_length()
                    .unwrap_or_else(|| state.inbound.current_sequence_length());
                descriptor.closed_peer_sequence_length = final_length;
                // The inward link will only ever carry the remnant of the
                // closed sequence.
                inward.start_decaying(
                    Some(final_length),
                    Some(state.outbound.current_sequence_number()),
                );
            } else if initiate_bypass {
                if let Some((peer_node_link, peer_sublink)) = state
                    .outward
                    .primary()
                    .and_then(|link| link.remote_identity())
                {
                    descriptor.proxy_peer_name = peer_node_link.remote_name();
                    descriptor.proxy_peer_sublink = peer_sublink;
                    descriptor.bypass_key = Some(key);
                    inward.start_decaying(None, None);
                    state.outward.start_decaying(None, None);
                }
                // A locked local-peer link lands here only when the fast
                // path bailed; the lock is surrendered so the route can
                // settle on its own.
                else if let Some(link) = state.outward.primary() {
                    link.unlock();
                }
            }
            state.inward = Some(inward);
            state.recompute_mode();
        }

        node_link.add_remote_router_link(
            new_sublink,
            None,
            LinkType::PeripheralInward,
            LinkSide::A,
            self.clone(),
        );
        descriptor
    }

    /// Completes a transfer after the descriptor reached the wire: adopts
    /// the links registered during serialization and unpauses traffic.
    pub(crate) fn begin_proxying_to_new_router(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
        descriptor: &RouterDescriptor,
    ) {
        let Some(new_link) = node_link.link_for_sublink(descriptor.new_sublink) else {
            // Torn down underneath us, presumably by disconnection.
            return;
        };
        let decaying_link = node_link.link_for_sublink(descriptor.new_decaying_sublink);

        let mut local_peer = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            debug_assert!(state.inward.is_some());
            if descriptor.proxy_already_bypassed {
                local_peer = state
                    .outward
                    .release_primary_link()
                    .and_then(|link| link.local_target());
                if let (Some(inward), Some(decaying_link)) =
                    (state.inward.as_mut(), decaying_link)
                {
                    inward.set_primary_link(decaying_link);
                }
            } else if let Some(inward) = state.inward.as_mut() {
                inward.set_primary_link(new_link.clone());
            }

            if state.outward.is_stable()
                && state.inward.as_ref().is_some_and(RouteEdge::is_stable)
            {
                if let Some(outward) = state.outward.primary() {
                    outward.mark_side_stable();
                }
            }
            state.recompute_mode();
        }

        if let Some(local_peer) = local_peer {
            local_peer.set_outward_link(new_link);
        }
        self.flush(true);
    }

    /// Builds a router from a received descriptor and wires it into the
    /// route over `node_link`.
    pub(crate) fn deserialize(
        descriptor: &RouterDescriptor,
        node_link: &Arc<NodeLink>,
    ) -> Option<Arc<Router>> {
        let router = Router::new(descriptor.side);
        {
            let mut guard = router.state.lock();
            let state = &mut *guard;
            state
                .outbound
                .reset_base(descriptor.next_outgoing_sequence_number);
            state
                .inbound
                .reset_base(descriptor.next_incoming_sequence_number);
            if descriptor.peer_closed {
                state.status.flags |= status_flags::PEER_CLOSED;
                if !state
                    .inbound
                    .set_final_length(descriptor.closed_peer_sequence_length)
                {
                    return None;
                }
                if state.inbound.is_dead() {
                    state.status.flags |= status_flags::DEAD;
                }
            }

            if descriptor.proxy_already_bypassed {
                // The decaying sublink forwards whatever the moved router
                // had already received; the primary sublink is the route's
                // new central link. Install the decaying one first so the
                // edge decays it, then adopt the central link as primary.
                let decaying_link = node_link.add_remote_router_link(
                    descriptor.new_decaying_sublink,
                    None,
                    LinkType::PeripheralOutward,
                    LinkSide::B,
                    router.clone(),
                );
                state.outward.set_primary_link(decaying_link);
                let decay_from = if descriptor.decaying_incoming_sequence_length
                    != SequenceNumber::ZERO
                {
                    descriptor.decaying_incoming_sequence_length
                } else {
                    descriptor.next_incoming_sequence_number
                };
                state.outward.start_decaying(
                    Some(state.outbound.current_sequence_number()),
                    Some(decay_from),
                );

                let link_state = if descriptor.new_link_state.is_null() {
                    None
                } else {
                    node_link.memory().adopt_fragment(descriptor.new_link_state)
                };
                let central = node_link.add_remote_router_link(
                    descriptor.new_sublink,
                    link_state,
                    LinkType::Central,
                    LinkSide::B,
                    router.clone(),
                );
                state.outward.set_primary_link(central);
                tracing::debug!(
                    sublink = %descriptor.new_sublink,
                    decaying = %descriptor.new_decaying_sublink,
                    "route moved from split pair"
                );
            } else {
                let link = node_link.add_remote_router_link(
                    descriptor.new_sublink,
                    None,
                    LinkType::PeripheralOutward,
                    LinkSide::B,
                    router.clone(),
                );
                state.outward.set_primary_link(link);
                tracing::debug!(sublink = %descriptor.new_sublink, "route extended");
            }
            state.recompute_mode();
        }

        if descriptor.proxy_peer_name.is_valid() {
            // The sender locked itself in for bypass before transmitting.
            router.initiate_proxy_bypass(
                node_link,
                descriptor.new_sublink,
                descriptor.proxy_peer_name,
                descriptor.proxy_peer_sublink,
                descriptor.bypass_key,
            );
        }

        router.flush(true);
        Some(router)
    }

    // =========================================================================
    // Proxy bypass
    // =========================================================================

    /// This router's outward peer is a proxy that has authorized its own
    /// bypass; reach out to the proxy's outward peer directly.
    pub(crate) fn initiate_proxy_bypass(
        self: &Arc<Self>,
        requesting_node_link: &Arc<NodeLink>,
        requesting_sublink: SublinkId,
        proxy_peer_name: NodeName,
        proxy_peer_sublink: SublinkId,
        key: Option<BypassKey>,
    ) -> bool {
        {
            let state = self.state.lock();
            match state.outward.primary() {
                // Already disconnected; nothing to bypass.
                None => return true,
                Some(link) => {
                    if !link.is_remote_link_to(requesting_node_link, requesting_sublink) {
                        tracing::warn!(
                            sublink = %requesting_sublink,
                            "rejecting bypass initiation from a link that is not our peer"
                        );
                        return false;
                    }
                }
            }
        }

        if proxy_peer_name != requesting_node_link.local_name() {
            // The proxy's outward peer is on a third node. Lock in our own
            // decay and ask that node to adopt us directly.
            let proxy_outbound_length;
            {
                let mut state = self.state.lock();
                proxy_outbound_length = state.outbound.current_sequence_number();
                if !state
                    .outward
                    .start_decaying(Some(proxy_outbound_length), None)
                {
                    return false;
                }
                state.recompute_mode();
            }

            let proxy_name = requesting_node_link.remote_name();
            let router = self.clone();
            requesting_node_link.node().establish_link(
                proxy_peer_name,
                Box::new(move |link| match link {
                    Some(link) => {
                        link.bypass_proxy(
                            proxy_name,
                            proxy_peer_sublink,
                            proxy_outbound_length,
                            router,
                            key,
                        );
                    }
                    None => {
                        tracing::warn!(
                            peer = %proxy_peer_name,
                            "failed to reach the proxy's peer; route stays proxied"
                        );
                    }
                }),
            );
            return true;
        }

        // The proxy's outward peer lives on this node; link up locally and
        // skip the wire round-trip.
        let Some(new_local_peer) = requesting_node_link.router_for_sublink(proxy_peer_sublink)
        else {
            return true;
        };
        let previous_outward_link;
        let proxy_inbound_length;
        let proxy_outbound_length;
        {
            let (mut own, mut peer) = lock_two(self, &new_local_peer);
            proxy_inbound_length = peer.outbound.current_sequence_number();
            proxy_outbound_length = own.outbound.current_sequence_number();

            if !own.outward.start_decaying(
                Some(proxy_outbound_length),
                Some(proxy_inbound_length),
            ) {
                return false;
            }
            previous_outward_link = peer.outward.primary().cloned();
            if !peer.outward.start_decaying(
                Some(proxy_inbound_length),
                Some(proxy_outbound_length),
            ) {
                return false;
            }

            let (link_a, link_b) = LocalRouterLink::new_pair(
                LinkType::Central,
                LocalLinkInitialState::CannotBypass,
                self.clone(),
                new_local_peer.clone(),
            );
            own.outward.set_primary_link(link_a);
            peer.outward.set_primary_link(link_b);
            own.recompute_mode();
            peer.recompute_mode();
        }

        match previous_outward_link {
            Some(link) => link.stop_proxying(proxy_inbound_length, proxy_outbound_length),
            None => {
                tracing::warn!("proxy bypass raced with local peer teardown");
            }
        }
        self.flush(false);
        new_local_peer.flush(false);
        true
    }

    /// A bypass request arrived from the proxy's successor with a fresh
    /// direct link. Validates it against the shared link state and swaps
    /// the proxy out.
    pub(crate) fn bypass_proxy_with_new_remote_link(
        self: &Arc<Self>,
        new_link: Arc<RemoteRouterLink>,
        proxy_outbound_length: SequenceNumber,
        key: Option<&BypassKey>,
    ) -> bool {
        let decaying_link;
        let proxy_inbound_length;
        let mut reject = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.outward.primary().is_none() {
                return true;
            }
            let source = new_link.node_link().remote_name();
            if !state.outward.can_node_request_bypass(source, key) {
                reject = true;
            }
            if reject {
                decaying_link = None;
                proxy_inbound_length = SequenceNumber::ZERO;
            } else {
                proxy_inbound_length = state.outbound.current_sequence_number();
                decaying_link = state.outward.primary().cloned();
                if !state.outward.start_decaying(
                    Some(proxy_inbound_length),
                    Some(proxy_outbound_length),
                ) {
                    reject = true;
                } else {
                    let dyn_link: Arc<dyn RouterLink> = new_link.clone();
                    state.outward.set_primary_link(dyn_link);
                    state.recompute_mode();
                }
            }
        }
        if reject {
            tracing::warn!("rejecting unauthorized proxy bypass request");
            new_link.deactivate();
            return false;
        }

        if let Some(link) = decaying_link {
            link.stop_proxying(proxy_inbound_length, proxy_outbound_length);
        }
        new_link.proxy_will_stop(proxy_inbound_length);
        self.flush(false);
        true
    }

    /// Same-node variant: the proxy sits between this router and a peer on
    /// the proxy's own node; swap to the fresh sublink that reaches the
    /// peer directly.
    pub(crate) fn bypass_proxy_with_new_link_to_same_node(
        self: &Arc<Self>,
        new_link: Arc<RemoteRouterLink>,
        proxy_inbound_length: SequenceNumber,
    ) -> bool {
        let decaying_link;
        let proxy_outbound_length;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.outward.primary().is_none() {
                return true;
            }
            if state.outward.local_peer().is_some() {
                drop(guard);
                new_link.deactivate();
                return false;
            }
            let same_node_link = state
                .outward
                .primary()
                .and_then(|link| link.remote_identity())
                .is_some_and(|(node_link, _)| Arc::ptr_eq(&node_link, new_link.node_link()));
            if !same_node_link {
                drop(guard);
                new_link.deactivate();
                return false;
            }

            proxy_outbound_length = state.outbound.current_sequence_number();
            decaying_link = state.outward.primary().cloned();
            if !state.outward.start_decaying(
                Some(proxy_outbound_length),
                Some(proxy_inbound_length),
            ) {
                drop(guard);
                new_link.deactivate();
                return false;
            }
            let dyn_link: Arc<dyn RouterLink> = new_link.clone();
            state.outward.set_primary_link(dyn_link);
            state.recompute_mode();
        }

        if let Some(link) = decaying_link {
            link.stop_proxying_to_local_peer(proxy_outbound_length);
        }
        self.flush(false);
        true
    }

    /// The outward peer acknowledged this proxy's bypass and pinned both
    /// final sequence lengths.
    pub(crate) fn stop_proxying(
        self: &Arc<Self>,
        proxy_inbound_length: SequenceNumber,
        proxy_outbound_length: SequenceNumber,
    ) -> bool {
        let mut bridge_peer = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.outward.is_decaying() {
                return false;
            }
            if state.bridge.is_some() {
                bridge_peer = state
                    .bridge
                    .as_ref()
                    .and_then(|bridge| bridge.decaying_local_peer());
                if bridge_peer.is_none() {
                    return false;
                }
            } else {
                match state.inward.as_mut() {
                    Some(inward) if inward.is_decaying() => {
                        inward.set_lengths(proxy_inbound_length, proxy_outbound_length);
                        state
                            .outward
                            .set_lengths(proxy_outbound_length, proxy_inbound_length);
                    }
                    _ => return false,
                }
            }
        }

        if let Some(peer) = &bridge_peer {
            // A merged-route bridge is a proxy made of two routers; the
            // sequence limits straddle all four edges.
            let (mut own, mut other) = lock_two(self, peer);
            let bridges_decaying = own.bridge.as_ref().is_some_and(|b| b.is_decaying())
                && other.bridge.as_ref().is_some_and(|b| b.is_decaying());
            if !bridges_decaying {
                return true;
            }
            own.outward
                .set_lengths(proxy_outbound_length, proxy_inbound_length);
            other
                .outward
                .set_lengths(proxy_inbound_length, proxy_outbound_length);
            if let Some(bridge) = own.bridge.as_mut() {
                bridge.set_lengths(proxy_inbound_length, proxy_outbound_length);
            }
            if let Some(bridge) = other.bridge.as_mut() {
                bridge.set_lengths(proxy_outbound_length, proxy_inbound_length);
            }
        }

        self.flush(false);
        if let Some(peer) = bridge_peer {
            peer.flush(false);
        }
        true
    }

    /// Same-node retirement reply: pins the outbound final length across
    /// this proxy and its local peer.
    pub(crate) fn stop_proxying_to_local_peer(
        self: &Arc<Self>,
        proxy_outbound_length: SequenceNumber,
    ) -> bool {
        enum Shape {
            Plain(Arc<Router>),
            Bridged(Arc<Router>),
        }
        let shape = {
            let state = self.state.lock();
            if let Some(bridge) = state.bridge.as_ref() {
                match bridge.decaying_local_peer() {
                    Some(peer) => Shape::Bridged(peer),
                    None => return false,
                }
            } else if state.outward.is_decaying() {
                match state.outward.decaying_local_peer() {
                    Some(peer) => Shape::Plain(peer),
                    None => return false,
                }
            } else {
                return false;
            }
        };

        match shape {
            Shape::Plain(local_peer) => {
                {
                    let (mut own, mut peer) = lock_two(self, &local_peer);
                    let own_ready = own.outward.is_decaying()
                        && own.inward.as_ref().is_some_and(|inward| inward.is_decaying());
                    if peer.outward.is_stable() || !own_ready {
                        return false;
                    }
                    peer.outward.set_length_from_decaying(proxy_outbound_length);
                    own.outward.set_length_to_decaying(proxy_outbound_length);
                    if let Some(inward) = own.inward.as_mut() {
                        inward.set_length_from_decaying(proxy_outbound_length);
                    }
                }
                self.flush(false);
                local_peer.flush(false);
                true
            }
            Shape::Bridged(bridge_peer) => {
                let local_peer = {
                    let state = bridge_peer.state.lock();
                    if !state.outward.is_decaying() {
                        return false;
                    }
                    match state.outward.decaying_local_peer() {
                        Some(peer) => peer,
                        None => return false,
                    }
                };
                {
                    let routers = [&**self, &*local_peer, &*bridge_peer];
                    let mut guards = lock_many(&routers);
                    let (own, rest) = match guards.split_first_mut() {
                        Some(split) => split,
                        None => return false,
                    };
                    let (peer, bridge_guard) = match rest.split_first_mut() {
                        Some((peer, tail)) => match tail.first_mut() {
                            Some(bridge_guard) => (peer, bridge_guard),
                            None => return false,
                        },
                        None => return false,
                    };
                    if peer.outward.is_stable()
                        || !own.outward.is_decaying()
                        || !bridge_guard.outward.is_decaying()
                    {
                        return false;
                    }
                    peer.outward.set_length_from_decaying(proxy_outbound_length);
                    own.outward.set_length_from_decaying(proxy_outbound_length);
                    if let Some(bridge) = own.bridge.as_mut() {
                        bridge.set_length_to_decaying(proxy_outbound_length);
                    }
                    bridge_guard
                        .outward
                        .set_length_to_decaying(proxy_outbound_length);
                    if let Some(bridge) = bridge_guard.bridge.as_mut() {
                        bridge.set_length_from_decaying(proxy_outbound_length);
                    }
                }
                self.flush(false);
                local_peer.flush(false);
                bridge_peer.flush(false);
                true
            }
        }
    }

    /// The proxy this router just bypassed announced its final inbound
    /// length; parcels beyond it come over the direct link.
    pub(crate) fn on_proxy_will_stop(
        self: &Arc<Self>,
        proxy_inbound_length: SequenceNumber,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if state.outward.is_stable() {
                return true;
            }
            if state.outward.length_from_decaying().is_some() {
                return true;
            }
            state
                .outward
                .set_length_from_decaying(proxy_inbound_length);
        }
        self.flush(false);
        true
    }

    /// If this proxy is stable on both sides, locks the route and asks its
    /// successor to initiate the bypass.
    fn maybe_initiate_self_removal(self: &Arc<Self>) -> bool {
        let key = BypassKey::random();
        let successor;
        let local_peer;
        let mut peer_identity = None;
        {
            let mut state = self.state.lock();
            let inward_ready = state.inward.as_ref().is_some_and(RouteEdge::is_stable);
            if !inward_ready {
                return false;
            }
            let Some((successor_node_link, _)) = state
                .inward
                .as_ref()
                .and_then(|inward| inward.primary())
                .and_then(|link| link.remote_identity())
            else {
                return false;
            };
            successor = match state.inward.as_ref().and_then(|inward| inward.primary()) {
                Some(link) => link.clone(),
                None => return false,
            };

            if !state
                .outward
                .try_lock_primary_for_bypass(successor_node_link.remote_name(), Some(key))
            {
                tracing::debug!("proxy self-removal blocked by busy outward link");
                return false;
            }

            local_peer = state.outward.local_peer();
            if local_peer.is_none() {
                peer_identity = state
                    .outward
                    .primary()
                    .and_then(|link| link.remote_identity())
                    .map(|(node_link, sublink)| (node_link.remote_name(), sublink));
            }
        }

        let Some(local_peer) = local_peer else {
            let Some((peer_name, peer_sublink)) = peer_identity else {
                return false;
            };
            {
                let mut state = self.state.lock();
                state.outward.start_decaying(None, None);
                if let Some(inward) = state.inward.as_mut() {
                    inward.start_decaying(None, None);
                }
                state.recompute_mode();
            }
            tracing::debug!(
                peer = %peer_name,
                sublink = %peer_sublink,
                "proxy initiating its own bypass"
            );
            successor.request_proxy_bypass_initiation(peer_name, peer_sublink, key);
            return true;
        };

        // The outward peer is local: wire it straight to the successor's
        // node with a fresh sublink and let the successor adopt it.
        let Some((successor_node_link, _)) = successor.remote_identity() else {
            return false;
        };
        let new_sublink = successor_node_link.allocate_sublink();
        let link_state = successor_node_link.memory().allocate_router_link_state();
        let (state_for_link, carried_state) = match link_state {
            Some(state) => {
                let carried = state.clone_ref();
                (Some(state), carried)
            }
            None => (None, None),
        };
        let new_link = successor_node_link.add_remote_router_link(
            new_sublink,
            state_for_link,
            LinkType::Central,
            LinkSide::A,
            local_peer.clone(),
        );

        let sequence_length;
        {
            let (mut own, mut peer) = lock_two(self, &local_peer);
            if peer.outward.primary().is_none() {
                tracing::debug!("proxy self-removal blocked by peer closure");
                return false;
            }
            sequence_length = peer.outbound.current_sequence_number();
            peer.outward.start_decaying(Some(sequence_length), None);
            own.outward.start_decaying(None, Some(sequence_length));
            if let Some(inward) = own.inward.as_mut() {
                inward.start_decaying(Some(sequence_length), None);
            }
            own.recompute_mode();
            peer.recompute_mode();
        }

        let carried_descriptor = carried_state
            .map(|carried| carried.release())
            .unwrap_or_default();
        successor.bypass_proxy_to_same_node(new_sublink, carried_descriptor, sequence_length);
        local_peer.set_outward_link(new_link);
        true
    }

    /// If this router bridges two merged routes and both outer links can
    /// be locked, collapses the bridge.
    fn maybe_initiate_bridge_bypass(self: &Arc<Self>) {
        let second_bridge = {
            let state = self.state.lock();
            let Some(bridge) = state.bridge.as_ref() else {
                return;
            };
            if bridge.is_decaying() {
                return;
            }
            match bridge.local_peer() {
                Some(peer) => peer,
                None => return,
            }
        };

        let mut first_bridge = self.clone();
        let mut second_bridge = second_bridge;
        let mut first_peer;
        let mut second_peer;
        let mut link_to_first_peer;
        let mut link_to_second_peer;
        let key = BypassKey::random();
        {
            let (own, other) = lock_two(&first_bridge, &second_bridge);
            link_to_first_peer = match own.outward.primary() {
                Some(link) => link.clone(),
                None => return,
            };
            link_to_second_peer = match other.outward.primary() {
                Some(link) => link.clone(),
                None => return,
            };
            first_peer = link_to_first_peer.local_target();
            second_peer = link_to_second_peer.local_target();
            drop(own);
            drop(other);

            if first_peer.is_none() && second_peer.is_some() {
                // Normalize: a local peer, when present, is the first one.
                std::mem::swap(&mut first_bridge, &mut second_bridge);
                std::mem::swap(&mut first_peer, &mut second_peer);
                std::mem::swap(&mut link_to_first_peer, &mut link_to_second_peer);
            }

            // The second peer (remote in every case but the all-local one)
            // will be the node presenting the bypass request to the first
            // peer; authorize it up front.
            let second_peer_source = link_to_second_peer
                .remote_identity()
                .map(|(node_link, _)| node_link.remote_name())
                .unwrap_or_default();
            if !link_to_first_peer.try_lock_for_bypass(second_peer_source, Some(key)) {
                return;
            }
            if !link_to_second_peer.try_lock_for_bypass(NodeName::default(), None) {
                link_to_first_peer.unlock();
                return;
            }
        }

        // Both outer links are locked for decay; from here the bridged
        // pair behaves like a single proxy being bypassed.
        let first_local = first_peer;
        let second_local = second_peer;

        if first_local.is_none() && second_local.is_none() {
            {
                let (mut own, mut other) = lock_two(&first_bridge, &second_bridge);
                own.outward.start_decaying(None, None);
                other.outward.start_decaying(None, None);
                if let Some(bridge) = own.bridge.as_mut() {
                    bridge.start_decaying(None, None);
                }
                if let Some(bridge) = other.bridge.as_mut() {
                    bridge.start_decaying(None, None);
                }
            }
            // Ask the second peer to bypass us by connecting to the first
            // peer directly, presenting the key stored on that link.
            if let Some((first_node_link, first_sublink)) = link_to_first_peer.remote_identity()
            {
                link_to_second_peer.request_proxy_bypass_initiation(
                    first_node_link.remote_name(),
                    first_sublink,
                    key,
                );
            }
            return;
        }

        let Some(first_local) = first_local else {
            return;
        };

        if second_local.is_none() {
            // Equivalent to same-node proxy bypass: the first peer is
            // local to the bridge, the second is remote.
            let Some((second_node_link, _)) = link_to_second_peer.remote_identity() else {
                return;
            };
            let bypass_sublink = second_node_link.allocate_sublink();
            let link_state = second_node_link.memory().allocate_router_link_state();
            let (state_for_link, carried_state) = match link_state {
                Some(state) => {
                    let carried = state.clone_ref();
                    (Some(state), carried)
                }
                None => (None, None),
            };
            let new_link = second_node_link.add_remote_router_link(
                bypass_sublink,
                state_for_link,
                LinkType::Central,
                LinkSide::A,
                first_local.clone(),
            );

            let length_from_local_peer;
            {
                let routers = [&*first_bridge, &*second_bridge, &*first_local];
                let mut guards = lock_many(&routers);
                length_from_local_peer = guards[2].outbound.current_sequence_number();
                guards[2]
                    .outward
                    .start_decaying(Some(length_from_local_peer), None);
                guards[1]
                    .outward
                    .start_decaying(Some(length_from_local_peer), None);
                if let Some(bridge) = guards[0].bridge.as_mut() {
                    bridge.start_decaying(Some(length_from_local_peer), None);
                }
                guards[0]
                    .outward
                    .start_decaying(None, Some(length_from_local_peer));
                if let Some(bridge) = guards[1].bridge.as_mut() {
                    bridge.start_decaying(None, Some(length_from_local_peer));
                }
            }

            let carried_descriptor = carried_state
                .map(|carried| carried.release())
                .unwrap_or_default();
            link_to_second_peer.bypass_proxy_to_same_node(
                bypass_sublink,
                carried_descriptor,
                length_from_local_peer,
            );
            first_local.set_outward_link(new_link);
            first_bridge.flush(false);
            second_bridge.flush(false);
            first_local.flush(false);
            return;
        }

        // Everything is local: relink the two outer routers directly and
        // let all four involved routers decay.
        let Some(second_local) = second_local else {
            return;
        };
        {
            let routers = [
                &*first_bridge,
                &*second_bridge,
                &*first_local,
                &*second_local,
            ];
            let mut guards = lock_many(&routers);
            let length_from_first = guards[2].outbound.current_sequence_number();
            let length_from_second = guards[3].outbound.current_sequence_number();

            guards[2]
                .outward
                .start_decaying(Some(length_from_first), Some(length_from_second));
            guards[3]
                .outward
                .start_decaying(Some(length_from_second), Some(length_from_first));
            guards[0]
                .outward
                .start_decaying(Some(length_from_second), Some(length_from_first));
            guards[1]
                .outward
                .start_decaying(Some(length_from_first), Some(length_from_second));
            if let Some(bridge) = guards[0].bridge.as_mut() {
                bridge.start_decaying(Some(length_from_first), Some(length_from_second));
            }
            if let Some(bridge) = guards[1].bridge.as_mut() {
                bridge.start_decaying(Some(length_from_second), Some(length_from_first));
            }

            let (link_a, link_b) = LocalRouterLink::new_pair(
                LinkType::Central,
                LocalLinkInitialState::CannotBypass,
                first_local.clone(),
                second_local.clone(),
            );
            guards[2].outward.set_primary_link(link_a);
            guards[3].outward.set_primary_link(link_b);
        }

        first_bridge.flush(false);
        second_bridge.flush(false);
        first_local.flush(false);
        second_local.flush(false);
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Re-examines queues, decay progress, closure propagation, and bypass
    /// eligibility. The workhorse behind every state change.
    pub(crate) fn flush(self: &Arc<Self>, force_bypass_attempt: bool) {
        let mut outbound_to_decaying = Vec::new();
        let mut outbound_to_primary = Vec::new();
        let mut inbound_to_decaying = Vec::new();
        let mut inbound_to_primary = Vec::new();
        let mut bridge_parcels = Vec::new();

        let inward_link;
        let outward_link;
        let bridge_link;
        let decaying_inward_link;
        let decaying_outward_link;
        let mut dead_outward_link = None;
        let mut dead_inward_link = None;
        let mut dead_bridge_link = None;
        let mut inward_link_decayed = false;
        let mut outward_link_decayed = false;
        let on_central_link;
        let mut dropped_last_decaying_link = false;
        let mut final_outward_length = None;
        let mut final_inward_length = None;

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            inward_link = state
                .inward
                .as_ref()
                .and_then(|edge| edge.primary())
                .cloned();
            outward_link = state.outward.primary().cloned();
            on_central_link = outward_link
                .as_ref()
                .is_some_and(|link| link.link_type().is_central());
            decaying_inward_link = state
                .inward
                .as_ref()
                .and_then(|edge| edge.decaying())
                .cloned();
            decaying_outward_link = state.outward.decaying().cloned();
            bridge_link = state.bridge.as_ref().and_then(|bridge| {
                bridge.primary().cloned().or_else(|| bridge.decaying().cloned())
            });

            state.outward.flush_parcels(
                &mut state.outbound,
                &mut outbound_to_decaying,
                &mut outbound_to_primary,
            );
            let outbound_sent = state.outbound.current_sequence_number();
            let inbound_received = state.inbound.current_sequence_length();
            if state
                .outward
                .try_finish_decay(outbound_sent, inbound_received)
            {
                outward_link_decayed = true;
            }

            if let Some(inward) = state.inward.as_mut() {
                inward.flush_parcels(
                    &mut state.inbound,
                    &mut inbound_to_decaying,
                    &mut inbound_to_primary,
                );
                let inbound_sent = state.inbound.current_sequence_number();
                let outbound_received = state.outbound.current_sequence_length();
                if inward.try_finish_decay(inbound_sent, outbound_received) {
                    inward_link_decayed = true;
                }
            }

            if bridge_link.is_some() {
                while let Some(parcel) = state.inbound.pop() {
                    bridge_parcels.push(parcel);
                }
            }
            if let Some(bridge) = state.bridge.as_mut() {
                if bridge.is_decaying()
                    && bridge.try_finish_decay(
                        state.inbound.current_sequence_number(),
                        state.outbound.current_sequence_number(),
                    )
                {
                    state.bridge = None;
                }
            }

            // Dropping the last decaying link may make this side stable,
            // unblocking bypass or closure on the central link.
            let inward_stable = decaying_inward_link.is_none() || inward_link_decayed;
            let outward_stable = decaying_outward_link.is_none() || outward_link_decayed;
            let both_stable = inward_stable && outward_stable;
            let any_decayed = inward_link_decayed || outward_link_decayed;
            if on_central_link && any_decayed && both_stable {
                if let Some(outward) = state.outward.primary() {
                    outward.mark_side_stable();
                }
                dropped_last_decaying_link = true;
            }

            if on_central_link
                && state.outbound.is_dead()
                && state
                    .outward
                    .primary()
                    .is_some_and(|link| link.try_lock_for_closure())
            {
                // Our side is gone and everything has been transmitted;
                // propagate closure and retire the link.
                dead_outward_link = state.outward.release_primary_link();
                final_outward_length = state.outbound.final_length();
            } else if !state.inbound.expects_more() {
                // Everything the other side will ever send has arrived.
                dead_outward_link = state.outward.release_primary_link();
            }

            if state.inbound.is_dead() {
                final_inward_length = state.inbound.final_length();
                if let Some(inward) = state.inward.as_mut() {
                    dead_inward_link = inward.release_primary_link();
                } else if state.bridge.is_some() {
                    dead_bridge_link = bridge_link.clone();
                    state.bridge = None;
                }
            }
            state.recompute_mode();
        }

        if on_central_link {
            if let Some(outward) = &outward_link {
                outward.share_link_state_if_necessary();
            }
        }

        for parcel in outbound_to_decaying {
            if let Some(link) = &decaying_outward_link {
                link.accept_parcel(parcel);
            }
        }
        for parcel in outbound_to_primary {
            if let Some(link) = &outward_link {
                link.accept_parcel(parcel);
            }
        }
        for parcel in inbound_to_decaying {
            if let Some(link) = &decaying_inward_link {
                link.accept_parcel(parcel);
            }
        }
        for parcel in inbound_to_primary {
            if let Some(link) = &inward_link {
                link.accept_parcel(parcel);
            }
        }
        for parcel in bridge_parcels {
            if let Some(link) = &bridge_link {
                link.accept_parcel(parcel);
            }
        }

        if outward_link_decayed {
            if let Some(link) = &decaying_outward_link {
                link.deactivate();
            }
        }
        if inward_link_decayed {
            if let Some(link) = &decaying_inward_link {
                link.deactivate();
            }
        }

        if bridge_link.is_some()
            && outward_link.is_some()
            && inward_link.is_none()
            && decaying_inward_link.is_none()
            && decaying_outward_link.is_none()
        {
            self.maybe_initiate_bridge_bypass();
        }

        if let Some(link) = &dead_outward_link {
            if let Some(length) = final_outward_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }
        if let Some(link) = &dead_inward_link {
            if let Some(length) = final_inward_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }
        if let Some(link) = &dead_bridge_link {
            if let Some(length) = final_inward_length {
                link.accept_route_closure(length);
            }
        }

        if dead_outward_link.is_some() || !on_central_link {
            return;
        }
        if !dropped_last_decaying_link && !force_bypass_attempt {
            return;
        }
        if inward_link.is_some() && self.maybe_initiate_self_removal() {
            return;
        }
        if let Some(outward) = &outward_link {
            outward.flush_other_side_if_waiting();
        }
    }

    /// A node link died with `sublink` bound to this router.
    pub(crate) fn notify_link_disconnected(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
        sublink: SublinkId,
    ) {
        let mut outward_hit = false;
        let mut inward_hit = false;
        {
            let state = self.state.lock();
            if state.outward.is_routed_through(node_link, sublink) {
                outward_hit = true;
            } else if state
                .inward
                .as_ref()
                .is_some_and(|inward| inward.is_routed_through(node_link, sublink))
            {
                inward_hit = true;
            }
        }
        if outward_hit {
            self.accept_route_disconnection(LinkType::PeripheralOutward);
        } else if inward_hit {
            self.accept_route_disconnection(LinkType::PeripheralInward);
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Logs this router's state.
    pub fn log_description(&self) {
        let state = self.state.lock();
        tracing::info!(
            mode = ?state.mode,
            side = %state.side,
            status_flags = state.status.flags,
            outward = %state.outward.describe(),
            inward = state
                .inward
                .as_ref()
                .map(|edge| edge.describe())
                .unwrap_or_else(|| "none".to_string()),
            bridge = state
                .bridge
                .as_ref()
                .map(|edge| edge.describe())
                .unwrap_or_else(|| "none".to_string()),
            "router"
        );
    }

    /// Logs this router and every router outward from here.
    pub fn log_route_trace(self: &Arc<Self>) {
        self.log_description();
        let next = self.state.lock().outward.primary().cloned();
        if let Some(link) = next {
            link.log_route_trace();
        }
    }

    /// Continues a route trace arriving over `link_type`.
    pub(crate) fn accept_log_route_trace(self: &Arc<Self>, link_type: LinkType) {
        self.log_description();
        let next = {
            let state = self.state.lock();
            if link_type.is_central() || link_type.is_peripheral_outward() {
                if let Some(bridge) = state.bridge.as_ref() {
                    bridge.primary().cloned()
                } else if let Some(inward) = state.inward.as_ref() {
                    inward.primary().cloned()
                } else {
                    None
                }
            } else {
                state.outward.primary().cloned()
            }
        };
        if let Some(link) = next {
            link.log_route_trace();
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Router")
            .field("side", &state.side)
            .field("mode", &state.mode)
            .field("status", &state.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parcel(data: &'static [u8]) -> Parcel {
        Parcel::new(Bytes::from_static(data))
    }

    fn stamped(n: u64, data: &'static [u8]) -> Parcel {
        let mut parcel = parcel(data);
        parcel.set_sequence_number(SequenceNumber::new(n));
        parcel
    }

    #[test]
    fn test_local_pair_echo() {
        let (a, b) = Router::new_pair();
        assert_eq!(a.routing_mode(), RoutingMode::Active);

        a.send(parcel(b"hello"), None).expect("send");
        let status = b.query_status();
        assert_eq!(status.num_local_parcels, 1);
        assert_eq!(status.num_local_bytes, 5);

        let received = b.get_next_parcel().expect("get");
        assert_eq!(received.data(), b"hello");
        assert!(matches!(
            b.get_next_parcel(),
            Err(PortalError::Unavailable)
        ));
    }

    #[test]
    fn test_scrambled_inbound_delivery_pops_in_order() {
        let (_a, b) = Router::new_pair();
        let order = [5u64, 2, 1, 0, 4, 3, 9, 6, 8, 7, 10, 11, 12, 15, 13, 14];
        for &n in &order {
            b.accept_inbound_parcel(stamped(n, b"x"));
            let expected_available = {
                let mut seen = [false; 16];
                for &m in &order {
                    seen[m as usize] = true;
                    if m == n {
                        break;
                    }
                }
                seen.iter().take_while(|&&present| present).count()
            };
            assert_eq!(b.query_status().num_local_parcels, expected_available);
        }
        for expected in 0..16u64 {
            let received = b.get_next_parcel().expect("get");
            assert_eq!(received.sequence_number(), SequenceNumber::new(expected));
        }
    }

    #[test]
    fn test_duplicate_sequence_number_is_dropped() {
        let (_a, b) = Router::new_pair();
        b.accept_inbound_parcel(stamped(0, b"first"));
        b.accept_inbound_parcel(stamped(0, b"second"));
        assert_eq!(b.query_status().num_local_parcels, 1);
        let received = b.get_next_parcel().expect("get");
        assert_eq!(received.data(), b"first");
    }

    #[test]
    fn test_closure_mid_sequence() {
        let (a, b) = Router::new_pair();
        a.send(parcel(b"p0"), None).expect("send");
        a.send(parcel(b"p1"), None).expect("send");
        a.close_route();

        assert_eq!(b.get_next_parcel().expect("get").data(), b"p0");
        assert_eq!(b.get_next_parcel().expect("get").data(), b"p1");
        let status = b.query_status();
        assert!(status.is_peer_closed());
        assert!(status.is_dead());
        assert!(matches!(b.get_next_parcel(), Err(PortalError::NotFound)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, b) = Router::new_pair();
        a.close_route();
        a.close_route();
        assert!(b.query_status().is_peer_closed());
    }

    #[test]
    fn test_send_after_peer_close_is_not_found() {
        let (a, b) = Router::new_pair();
        b.close_route();
        assert!(matches!(
            a.send(parcel(b"late"), None),
            Err(PortalError::NotFound)
        ));
    }

    #[test]
    fn test_outbound_limits() {
        let (a, _b) = Router::new_pair();
        let limits = Limits {
            max_queued_parcels: 1,
            max_queued_bytes: 4,
        };
        // Local peer's inbound queue is consulted directly.
        a.send(parcel(b"xy"), Some(&limits)).expect("first send");
        assert!(matches!(
            a.send(parcel(b"zw"), Some(&limits)),
            Err(PortalError::ResourceExhausted)
        ));
    }

    #[test]
    fn test_two_phase_put_laws() {
        let (a, b) = Router::new_pair();

        a.begin_put(8).expect("begin");
        assert!(matches!(a.begin_put(4), Err(PortalError::AlreadyExists)));
        a.abort_put().expect("abort");
        assert_eq!(b.query_status().num_local_parcels, 0);

        a.begin_put(8).expect("begin");
        a.with_put_span(|span| span[..5].copy_from_slice(b"hello"))
            .expect("write");
        a.commit_put(5, Vec::new(), Vec::new()).expect("commit");
        let received = b.get_next_parcel().expect("get");
        assert_eq!(received.data(), b"hello");
    }

    #[test]
    fn test_two_phase_get_partial_then_full() {
        let (a, b) = Router::new_pair();
        a.send(parcel(b"abcdef"), None).expect("send");

        let (data, _, _) = b.begin_get().expect("begin");
        assert_eq!(&data[..], b"abcdef");
        assert!(b.commit_get(2).expect("commit").is_none());

        let (data, _, _) = b.begin_get().expect("begin");
        assert_eq!(&data[..], b"cdef");
        let popped = b.commit_get(4).expect("commit");
        assert!(popped.is_some());
        assert!(matches!(b.get_next_parcel(), Err(PortalError::Unavailable)));
    }

    #[test]
    fn test_two_phase_get_abort_is_noop() {
        let (a, b) = Router::new_pair();
        a.send(parcel(b"data"), None).expect("send");
        let before = b.query_status();
        b.begin_get().expect("begin");
        b.abort_get().expect("abort");
        assert_eq!(b.query_status(), before);
        assert_eq!(b.get_next_parcel().expect("get").data(), b"data");
    }

    #[test]
    fn test_merge_bridges_two_local_routes() {
        let (a1, b1) = Router::new_pair();
        let (a2, b2) = Router::new_pair();
        b1.merge_route(&b2).expect("merge");

        a1.send(parcel(b"across"), None).expect("send");
        // The all-local bridge collapses and the parcel flows through to
        // the other route's endpoint.
        let received = a2.get_next_parcel().expect("get");
        assert_eq!(received.data(), b"across");

        a2.send(parcel(b"back"), None).expect("send");
        assert_eq!(a1.get_next_parcel().expect("get").data(), b"back");
    }

    #[test]
    fn test_merge_used_portal_fails() {
        let (a1, b1) = Router::new_pair();
        let (_a2, b2) = Router::new_pair();
        a1.send(parcel(b"x"), None).expect("send");
        b1.get_next_parcel().expect("get");
        assert!(matches!(
            b1.merge_route(&b2),
            Err(PortalError::FailedPrecondition { .. })
        ));
    }

    #[test]
    fn test_merge_with_self_or_peer_fails() {
        let (a, b) = Router::new_pair();
        assert!(matches!(
            a.merge_route(&b),
            Err(PortalError::InvalidArgument { .. })
        ));
    }
}
