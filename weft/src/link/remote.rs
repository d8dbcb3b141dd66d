//! Links between routers on different nodes.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{NodeName, SequenceNumber, SublinkId};

use crate::link::state::{BypassKey, RouterLinkState};
use crate::link::{LinkType, RouterLink};
use crate::node::link::NodeLink;
use crate::node::memory::{FragmentDescriptor, FragmentRef, AUX_BUFFER_SIZE};
use crate::parcel::Parcel;
use crate::router::Router;
use crate::status::Limits;
use crate::wire;

/// One side of a link multiplexed over a node link sublink.
///
/// Every operation frames a message; nothing blocks. The shared link state
/// may lag behind construction: side A of a central link allocates one
/// asynchronously when none was supplied, and side B may receive a
/// fragment descriptor before the backing buffer arrives. Until the state
/// resolves, state-dependent operations conservatively fail.
pub struct RemoteRouterLink {
    node_link: Arc<NodeLink>,
    sublink: SublinkId,
    link_type: LinkType,
    side: weft_core::LinkSide,
    state_ptr: AtomicPtr<RouterLinkState>,
    state_slot: Mutex<Option<FragmentRef<RouterLinkState>>>,
    side_is_stable: AtomicBool,
    must_share_state: AtomicBool,
}

impl RemoteRouterLink {
    /// Creates a link bound to `sublink` on `node_link`.
    ///
    /// A central side-A link created without state kicks off an async
    /// allocation and later tells side B where the state landed. A pending
    /// fragment resolves itself once its buffer arrives.
    pub fn create(
        node_link: Arc<NodeLink>,
        sublink: SublinkId,
        link_state: Option<FragmentRef<RouterLinkState>>,
        link_type: LinkType,
        side: weft_core::LinkSide,
    ) -> Arc<RemoteRouterLink> {
        let link = Arc::new(RemoteRouterLink {
            node_link,
            sublink,
            link_type,
            side,
            state_ptr: AtomicPtr::new(std::ptr::null_mut()),
            state_slot: Mutex::new(None),
            side_is_stable: AtomicBool::new(false),
            must_share_state: AtomicBool::new(false),
        });

        match link_state {
            Some(fragment) => link.set_link_state(fragment),
            None if link_type.is_central() && side.is_a() => {
                link.must_share_state.store(true, Ordering::Release);
                link.allocate_link_state();
            }
            None => {}
        }
        link
    }

    /// The node link this link is multiplexed on.
    pub fn node_link(&self) -> &Arc<NodeLink> {
        &self.node_link
    }

    /// The sublink binding this link.
    pub fn sublink(&self) -> SublinkId {
        self.sublink
    }

    /// Installs (or schedules installation of) the shared link state.
    pub fn set_link_state(self: &Arc<Self>, fragment: FragmentRef<RouterLinkState>) {
        debug_assert!(self.link_type.is_central());
        if !fragment.is_addressable() {
            // Buffer not here yet; re-adopt once it lands.
            let descriptor = fragment.descriptor();
            let memory = self.node_link.memory().clone();
            let this = self.clone();
            drop(fragment);
            self.node_link.memory().on_buffer_available(
                descriptor.buffer,
                Box::new(move || {
                    if let Some(resolved) = memory.adopt_fragment(descriptor) {
                        this.set_link_state(resolved);
                    }
                }),
            );
            return;
        }

        {
            let mut slot = self.state_slot.lock();
            if slot.is_some() {
                return;
            }
            if let Some(state) = fragment.get() {
                self.state_ptr
                    .store(state as *const _ as *mut RouterLinkState, Ordering::Release);
            }
            *slot = Some(fragment);
        }

        if self.side_is_stable.load(Ordering::Acquire) {
            self.mark_side_stable();
        }
        if let Some(router) = self.node_link.router_for_sublink(self.sublink) {
            router.flush(true);
        }
    }

    fn state(&self) -> Option<&RouterLinkState> {
        let ptr = self.state_ptr.load(Ordering::Acquire);
        // The fragment in `state_slot` pins the mapping for the life of
        // this link, and the pointer is never cleared once set.
        unsafe { ptr.as_ref() }
    }

    fn allocate_link_state(self: &Arc<Self>) {
        let this = self.clone();
        let memory = self.node_link.memory().clone();
        self.node_link.memory().request_capacity(
            AUX_BUFFER_SIZE,
            std::mem::size_of::<RouterLinkState>() as u32,
            Box::new(move || match memory.allocate_router_link_state() {
                Some(state) => this.set_link_state(state),
                // Fresh capacity already exhausted; go again.
                None => this.allocate_link_state(),
            }),
        );
    }
}

impl RouterLink for RemoteRouterLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn local_target(&self) -> Option<Arc<Router>> {
        None
    }

    fn is_remote_link_to(&self, node_link: &Arc<NodeLink>, sublink: SublinkId) -> bool {
        Arc::ptr_eq(&self.node_link, node_link) && self.sublink == sublink
    }

    fn remote_identity(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        Some((self.node_link.clone(), self.sublink))
    }

    fn mark_side_stable(&self) {
        self.side_is_stable.store(true, Ordering::Release);
        if let Some(state) = self.state() {
            state.set_side_stable(self.side);
        }
    }

    fn try_lock_for_bypass(&self, source: NodeName, key: Option<BypassKey>) -> bool {
        match self.state() {
            Some(state) => state.try_lock_for_bypass(self.side, source, key),
            None => false,
        }
    }

    fn try_lock_for_closure(&self) -> bool {
        match self.state() {
            Some(state) => state.try_lock_for_closure(self.side),
            None => false,
        }
    }

    fn unlock(&self) {
        if let Some(state) = self.state() {
            state.unlock(self.side);
        }
    }

    fn flush_other_side_if_waiting(&self) {
        let Some(state) = self.state() else {
            return;
        };
        if state.reset_waiting_bit(self.side.opposite()) {
            self.node_link
                .transmit(wire::Body::FlushRouter(wire::FlushRouter {
                    sublink: self.sublink,
                }));
        }
    }

    fn can_node_request_bypass(&self, source: NodeName, key: Option<&BypassKey>) -> bool {
        match self.state() {
            Some(state) => state.validate_bypass_request(self.side, source, key),
            None => false,
        }
    }

    fn would_parcel_exceed_limits(&self, _data_size: usize, _limits: &Limits) -> bool {
        // Remote queue depths are not mirrored into link state; the
        // receiving side still enforces its own bound.
        false
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        let routers = parcel.take_routers();
        let handles = parcel.take_handles();

        // Serialize each attached portal into a descriptor for the
        // destination node. The attached routers become proxies (or hand
        // off entirely) only after the parcel is on the wire.
        let mut descriptors = Vec::with_capacity(routers.len());
        for router in &routers {
            descriptors.push(router.serialize_new_router(&self.node_link));
        }

        tracing::debug!(
            sublink = %self.sublink,
            parcel = %parcel.describe(),
            "transmitting parcel"
        );
        self.node_link.transmit_with_handles(
            wire::Body::AcceptParcel(wire::AcceptParcel {
                sublink: self.sublink,
                sequence_number: parcel.sequence_number(),
                data: parcel.data().to_vec(),
                descriptors: descriptors.clone(),
                num_handles: handles.len() as u32,
            }),
            handles,
        );

        // Now that the descriptors are on the wire it is safe to wire the
        // senders into their new routes.
        for (router, descriptor) in routers.iter().zip(descriptors.iter()) {
            router.begin_proxying_to_new_router(&self.node_link, descriptor);
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.node_link
            .transmit(wire::Body::RouteClosed(wire::RouteClosed {
                sublink: self.sublink,
                sequence_length,
            }));
    }

    fn accept_route_disconnection(&self) {
        // Disconnection has no final length; the sentinel tells the other
        // side the sequence ends wherever it happens to end.
        self.node_link
            .transmit(wire::Body::RouteClosed(wire::RouteClosed {
                sublink: self.sublink,
                sequence_length: wire::DISCONNECT_SEQUENCE_LENGTH,
            }));
    }

    fn request_proxy_bypass_initiation(
        &self,
        peer_name: NodeName,
        peer_sublink: SublinkId,
        key: BypassKey,
    ) {
        self.node_link
            .transmit(wire::Body::InitiateProxyBypass(wire::InitiateProxyBypass {
                sublink: self.sublink,
                proxy_peer_name: peer_name,
                proxy_peer_sublink: peer_sublink,
                bypass_key: key.to_bytes(),
            }));
    }

    fn stop_proxying(&self, inbound: SequenceNumber, outbound: SequenceNumber) {
        self.node_link
            .transmit(wire::Body::StopProxying(wire::StopProxying {
                sublink: self.sublink,
                proxy_inbound_sequence_length: inbound,
                proxy_outbound_sequence_length: outbound,
            }));
    }

    fn proxy_will_stop(&self, inbound: SequenceNumber) {
        self.node_link
            .transmit(wire::Body::ProxyWillStop(wire::ProxyWillStop {
                sublink: self.sublink,
                proxy_inbound_sequence_length: inbound,
            }));
    }

    fn bypass_proxy_to_same_node(
        &self,
        new_sublink: SublinkId,
        new_link_state: FragmentDescriptor,
        inbound: SequenceNumber,
    ) {
        self.node_link
            .transmit(wire::Body::BypassProxyToSameNode(wire::BypassProxyToSameNode {
                sublink: self.sublink,
                new_sublink,
                new_link_state,
                proxy_inbound_sequence_length: inbound,
            }));
    }

    fn stop_proxying_to_local_peer(&self, outbound: SequenceNumber) {
        self.node_link
            .transmit(wire::Body::StopProxyingToLocalPeer(
                wire::StopProxyingToLocalPeer {
                    sublink: self.sublink,
                    proxy_outbound_sequence_length: outbound,
                },
            ));
    }

    fn share_link_state_if_necessary(&self) {
        if !self.must_share_state.load(Ordering::Acquire) {
            return;
        }
        if self.state().is_none() {
            // Allocation still in flight; try again on a later flush.
            return;
        }
        if self
            .must_share_state
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let descriptor = {
            let slot = self.state_slot.lock();
            match slot.as_ref().and_then(FragmentRef::clone_ref) {
                Some(clone) => clone.release(),
                None => return,
            }
        };
        self.node_link
            .transmit(wire::Body::SetRouterLinkStateFragment(
                wire::SetRouterLinkStateFragment {
                    sublink: self.sublink,
                    descriptor,
                },
            ));
    }

    fn deactivate(&self) {
        self.node_link.remove_sublink(self.sublink);
    }

    fn describe(&self) -> String {
        format!(
            "{} {} link to {} via sublink {}",
            self.side,
            self.link_type,
            self.node_link.remote_name(),
            self.sublink
        )
    }

    fn log_route_trace(&self) {
        self.node_link
            .transmit(wire::Body::LogRouteTrace(wire::LogRouteTrace {
                sublink: self.sublink,
            }));
    }
}
