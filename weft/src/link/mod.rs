//! Links between neighboring routers.
//!
//! A conceptual link has two `RouterLink` objects, one per side, each held
//! by the router on that side. [`LocalRouterLink`] connects two routers in
//! the same node with direct calls; [`RemoteRouterLink`] frames each call
//! into a message multiplexed on a node link sublink.

use std::fmt;
use std::sync::Arc;

use weft_core::{NodeName, SequenceNumber, SublinkId};

use crate::node::link::NodeLink;
use crate::node::memory::FragmentDescriptor;
use crate::parcel::Parcel;
use crate::router::Router;
use crate::status::Limits;
use state::BypassKey;

pub mod local;
pub mod remote;
pub mod state;

/// What role a link plays from the perspective of the router holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Connects the two halves of a route. Every route has at most one
    /// central link; it is the only kind with shared [`state`] and the only
    /// kind bypass operates on.
    Central,
    /// Connects a router to a successor closer to its own endpoint.
    PeripheralInward,
    /// Connects a router to a predecessor closer to the other endpoint.
    PeripheralOutward,
    /// Connects two merged routes through a local bridge pair.
    Bridge,
}

impl LinkType {
    /// Whether this is the route's central link.
    pub fn is_central(self) -> bool {
        matches!(self, LinkType::Central)
    }

    /// Whether this link faces inward, toward this half's endpoint.
    pub fn is_peripheral_inward(self) -> bool {
        matches!(self, LinkType::PeripheralInward)
    }

    /// Whether this link faces outward, toward the other half's endpoint.
    pub fn is_peripheral_outward(self) -> bool {
        matches!(self, LinkType::PeripheralOutward)
    }

    /// Whether this link bridges two merged routes.
    pub fn is_bridge(self) -> bool {
        matches!(self, LinkType::Bridge)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Central => write!(f, "central"),
            LinkType::PeripheralInward => write!(f, "peripheral-inward"),
            LinkType::PeripheralOutward => write!(f, "peripheral-outward"),
            LinkType::Bridge => write!(f, "bridge"),
        }
    }
}

/// One side of a link between two routers.
///
/// Calls deliver toward the router on the *other* side. Implementations
/// must be callable without any router lock held; the local variant takes
/// the target router's lock itself.
pub trait RouterLink: Send + Sync {
    /// This link's role from the holder's perspective.
    fn link_type(&self) -> LinkType;

    /// The router on the other side, when it lives in this node.
    fn local_target(&self) -> Option<Arc<Router>>;

    /// Whether this is a remote link running over `sublink` of `node_link`.
    fn is_remote_link_to(&self, node_link: &Arc<NodeLink>, sublink: SublinkId) -> bool;

    /// The node link and sublink this link runs over, when remote.
    fn remote_identity(&self) -> Option<(Arc<NodeLink>, SublinkId)>;

    /// Marks this side stable in the shared link state: no decaying links,
    /// not mid-handoff. Both sides must be stable before either may lock.
    fn mark_side_stable(&self);

    /// Locks the link so the router on this side can coordinate its own
    /// bypass, recording `source` (and `key`, when authentication is
    /// needed) for the other side to validate the eventual request.
    fn try_lock_for_bypass(&self, source: NodeName, key: Option<BypassKey>) -> bool;

    /// Locks the link so the router on this side can propagate closure.
    fn try_lock_for_closure(&self) -> bool;

    /// Releases a lock taken on this side.
    fn unlock(&self);

    /// If the other side is waiting for the link to stabilize and it now
    /// has, wakes the other side's router.
    fn flush_other_side_if_waiting(&self);

    /// Whether a bypass request from `source` presenting `key` is
    /// authorized against this link's shared state.
    fn can_node_request_bypass(&self, source: NodeName, key: Option<&BypassKey>) -> bool;

    /// Best-effort estimate of whether a parcel of `data_size` bytes would
    /// push the destination queue past `limits`.
    fn would_parcel_exceed_limits(&self, data_size: usize, limits: &Limits) -> bool;

    /// Delivers a parcel toward the other side.
    fn accept_parcel(&self, parcel: Parcel);

    /// Announces that this side's endpoint closed after `sequence_length`
    /// parcels.
    fn accept_route_closure(&self, sequence_length: SequenceNumber);

    /// Announces that the route broke somewhere on this side of the link.
    fn accept_route_disconnection(&self);

    /// Proxy → successor: go direct to the proxy's outward peer.
    fn request_proxy_bypass_initiation(
        &self,
        peer_name: NodeName,
        peer_sublink: SublinkId,
        key: BypassKey,
    );

    /// Outward peer → proxy: final lengths in both directions; retire once
    /// they are reached.
    fn stop_proxying(&self, inbound: SequenceNumber, outbound: SequenceNumber);

    /// Retiring proxy → its replacement peer: inbound parcels past
    /// `inbound` arrive direct.
    fn proxy_will_stop(&self, inbound: SequenceNumber);

    /// Proxy → successor, same-node case: a fresh sublink to the proxy's
    /// local outward peer.
    fn bypass_proxy_to_same_node(
        &self,
        new_sublink: SublinkId,
        new_link_state: FragmentDescriptor,
        inbound: SequenceNumber,
    );

    /// Successor → proxy, same-node case: outbound final length reply.
    fn stop_proxying_to_local_peer(&self, outbound: SequenceNumber);

    /// Shares the link state location with the other side if this side
    /// allocated it and has not yet told them.
    fn share_link_state_if_necessary(&self);

    /// Stops routing calls to the bound router.
    fn deactivate(&self);

    /// One-line description for logs.
    fn describe(&self) -> String;

    /// Forwards a route trace along this link.
    fn log_route_trace(&self);
}
