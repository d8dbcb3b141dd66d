//! In-process links between two routers on the same node.

use std::sync::Arc;

use weft_core::{LinkSide, NodeName, SequenceNumber, SublinkId};

use crate::link::state::{link_status, BypassKey, RouterLinkState};
use crate::link::{LinkType, RouterLink};
use crate::node::link::NodeLink;
use crate::node::memory::FragmentDescriptor;
use crate::parcel::Parcel;
use crate::router::Router;
use crate::status::Limits;

/// Whether a fresh local link starts lockable or must first stabilize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalLinkInitialState {
    /// Both sides start stable; either may lock immediately. The state of
    /// a brand new route.
    CanBypass,
    /// Both sides start unstable; each marks itself stable as its decaying
    /// links drain. The state of a link installed mid-bypass.
    CannotBypass,
}

struct SharedState {
    link_type: LinkType,
    state: RouterLinkState,
    routers: [Arc<Router>; 2],
}

impl SharedState {
    fn side(&self, side: LinkSide) -> &Arc<Router> {
        &self.routers[side.index()]
    }
}

/// One side of an in-process link. Calls go straight into the target
/// router under the target's own lock; the link state is an ordinary heap
/// value shared by the pair.
pub struct LocalRouterLink {
    side: LinkSide,
    shared: Arc<SharedState>,
}

impl LocalRouterLink {
    /// Creates both sides of a link between `first` (side A) and `second`
    /// (side B).
    pub fn new_pair(
        link_type: LinkType,
        initial_state: LocalLinkInitialState,
        first: Arc<Router>,
        second: Arc<Router>,
    ) -> (Arc<LocalRouterLink>, Arc<LocalRouterLink>) {
        debug_assert!(link_type.is_central() || link_type.is_bridge());
        let status = match initial_state {
            LocalLinkInitialState::CanBypass => link_status::STABLE,
            LocalLinkInitialState::CannotBypass => 0,
        };
        let shared = Arc::new(SharedState {
            link_type,
            state: RouterLinkState::new(status, 1),
            routers: [first, second],
        });
        (
            Arc::new(LocalRouterLink {
                side: LinkSide::A,
                shared: shared.clone(),
            }),
            Arc::new(LocalRouterLink {
                side: LinkSide::B,
                shared,
            }),
        )
    }

    fn target(&self) -> &Arc<Router> {
        self.shared.side(self.side.opposite())
    }
}

impl RouterLink for LocalRouterLink {
    fn link_type(&self) -> LinkType {
        self.shared.link_type
    }

    fn local_target(&self) -> Option<Arc<Router>> {
        Some(self.target().clone())
    }

    fn is_remote_link_to(&self, _node_link: &Arc<NodeLink>, _sublink: SublinkId) -> bool {
        false
    }

    fn remote_identity(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        None
    }

    fn mark_side_stable(&self) {
        self.shared.state.set_side_stable(self.side);
    }

    fn try_lock_for_bypass(&self, source: NodeName, key: Option<BypassKey>) -> bool {
        self.shared.state.try_lock_for_bypass(self.side, source, key)
    }

    fn try_lock_for_closure(&self) -> bool {
        self.shared.state.try_lock_for_closure(self.side)
    }

    fn unlock(&self) {
        self.shared.state.unlock(self.side);
    }

    fn flush_other_side_if_waiting(&self) {
        let other = self.side.opposite();
        if self.shared.state.reset_waiting_bit(other) {
            self.shared.side(other).flush(true);
        }
    }

    fn can_node_request_bypass(&self, source: NodeName, key: Option<&BypassKey>) -> bool {
        self.shared
            .state
            .validate_bypass_request(self.side, source, key)
    }

    fn would_parcel_exceed_limits(&self, data_size: usize, limits: &Limits) -> bool {
        self.target().would_inbound_parcel_exceed_limits(data_size, limits)
    }

    fn accept_parcel(&self, parcel: Parcel) {
        let target = self.target().clone();
        match self.shared.link_type {
            LinkType::Central => {
                target.accept_inbound_parcel(parcel);
            }
            LinkType::Bridge => {
                target.accept_outbound_parcel(parcel);
            }
            other => {
                debug_assert!(false, "local link with type {other}");
            }
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.target()
            .clone()
            .accept_route_closure(self.shared.link_type, sequence_length);
    }

    fn accept_route_disconnection(&self) {
        self.target()
            .clone()
            .accept_route_disconnection(self.shared.link_type);
    }

    fn request_proxy_bypass_initiation(
        &self,
        _peer_name: NodeName,
        _peer_sublink: SublinkId,
        _key: BypassKey,
    ) {
        debug_assert!(false, "bypass initiation has no local path");
    }

    fn stop_proxying(&self, _inbound: SequenceNumber, _outbound: SequenceNumber) {
        debug_assert!(false, "proxy retirement has no local path");
    }

    fn proxy_will_stop(&self, _inbound: SequenceNumber) {
        debug_assert!(false, "proxy retirement has no local path");
    }

    fn bypass_proxy_to_same_node(
        &self,
        _new_sublink: SublinkId,
        _new_link_state: FragmentDescriptor,
        _inbound: SequenceNumber,
    ) {
        debug_assert!(false, "same-node bypass has no local path");
    }

    fn stop_proxying_to_local_peer(&self, _outbound: SequenceNumber) {
        debug_assert!(false, "proxy retirement has no local path");
    }

    fn share_link_state_if_necessary(&self) {}

    fn deactivate(&self) {}

    fn describe(&self) -> String {
        format!(
            "{} {} link to local peer",
            self.side, self.shared.link_type
        )
    }

    fn log_route_trace(&self) {
        self.target()
            .clone()
            .accept_log_route_trace(self.shared.link_type);
    }
}
