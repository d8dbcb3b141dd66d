//! The duplex connection between two nodes.
//!
//! A node link owns one driver transport and one shared memory pool, and
//! multiplexes any number of sublinks (point-to-point router-to-router
//! channels) over them. Incoming frames are re-ordered by the sender's
//! transport sequence number before dispatch, since the underlying
//! transport makes no ordering promise of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use weft_core::{
    ActivityHandler, DriverHandle, LinkSide, NodeName, SequenceNumber, SharedRegion, SublinkId,
    Transport,
};

use crate::link::remote::RemoteRouterLink;
use crate::link::state::BypassKey;
use crate::link::{LinkType, RouterLink};
use crate::node::memory::NodeLinkMemory;
use crate::node::Node;
use crate::parcel::Parcel;
use crate::router::Router;
use crate::sequenced_queue::{QueueItem, SequencedQueue};
use crate::wire;

struct SublinkEntry {
    link: Arc<RemoteRouterLink>,
    receiver: Arc<Router>,
}

struct IncomingFrame {
    body: wire::Body,
    handles: Vec<DriverHandle>,
}

impl QueueItem for IncomingFrame {}

type MemoryCallback = Box<dyn FnOnce(Option<SharedRegion>) + Send>;

struct NodeLinkInner {
    active: bool,
    sublinks: HashMap<SublinkId, SublinkEntry>,
    incoming: SequencedQueue<IncomingFrame>,
    dispatching: bool,
    pending_memory: Vec<(u32, MemoryCallback)>,
}

/// One live connection to a remote node.
pub struct NodeLink {
    node: Arc<Node>,
    side: LinkSide,
    local_name: NodeName,
    remote_name: NodeName,
    transport: Arc<dyn Transport>,
    memory: Arc<NodeLinkMemory>,
    next_transport_seq: AtomicU64,
    next_sublink: AtomicU64,
    self_weak: Mutex<Weak<NodeLink>>,
    inner: Mutex<NodeLinkInner>,
}

impl NodeLink {
    /// Builds a link. The caller activates the transport once the link is
    /// registered with its node.
    pub(crate) fn create(
        node: Arc<Node>,
        side: LinkSide,
        local_name: NodeName,
        remote_name: NodeName,
        transport: Arc<dyn Transport>,
        memory: Arc<NodeLinkMemory>,
        num_initial_portals: u64,
    ) -> Arc<NodeLink> {
        // Side A's counter starts past the initial portals, which occupy
        // the first slots of its (even) half of the id space.
        let first_sublink = match side {
            LinkSide::A => num_initial_portals,
            LinkSide::B => 0,
        };
        let link = Arc::new(NodeLink {
            node,
            side,
            local_name,
            remote_name,
            transport,
            memory,
            next_transport_seq: AtomicU64::new(0),
            next_sublink: AtomicU64::new(first_sublink),
            self_weak: Mutex::new(Weak::new()),
            inner: Mutex::new(NodeLinkInner {
                active: true,
                sublinks: HashMap::new(),
                incoming: SequencedQueue::new(),
                dispatching: false,
                pending_memory: Vec::new(),
            }),
        });
        *link.self_weak.lock() = Arc::downgrade(&link);
        link
    }

    /// The node that owns this link.
    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// This link's shared memory pool.
    pub(crate) fn memory(&self) -> &Arc<NodeLinkMemory> {
        &self.memory
    }

    /// Name of this link's local node.
    pub(crate) fn local_name(&self) -> NodeName {
        self.local_name
    }

    /// Name of the remote node.
    pub(crate) fn remote_name(&self) -> NodeName {
        self.remote_name
    }

    fn strong(&self) -> Option<Arc<NodeLink>> {
        self.self_weak.lock().upgrade()
    }

    /// Mints a sublink id from this side's half of the id space.
    pub(crate) fn allocate_sublink(&self) -> SublinkId {
        let counter = self.next_sublink.fetch_add(1, Ordering::Relaxed);
        let side_bit = match self.side {
            LinkSide::A => 0,
            LinkSide::B => 1,
        };
        SublinkId((counter << 1) | side_bit)
    }

    /// The sublink id both sides derive for initial portal `i`.
    pub(crate) fn initial_portal_sublink(i: u64) -> SublinkId {
        SublinkId(i << 1)
    }

    /// Binds `sublink` to `router` with a new remote link object.
    pub(crate) fn add_remote_router_link(
        self: &Arc<Self>,
        sublink: SublinkId,
        link_state: Option<crate::node::memory::FragmentRef<crate::link::state::RouterLinkState>>,
        link_type: LinkType,
        link_side: LinkSide,
        router: Arc<Router>,
    ) -> Arc<RemoteRouterLink> {
        let link = RemoteRouterLink::create(
            self.clone(),
            sublink,
            link_state,
            link_type,
            link_side,
        );
        let mut inner = self.inner.lock();
        if inner.active {
            inner.sublinks.insert(
                sublink,
                SublinkEntry {
                    link: link.clone(),
                    receiver: router,
                },
            );
        }
        link
    }

    /// Unbinds `sublink`. Messages for it are ignored afterwards.
    pub(crate) fn remove_sublink(&self, sublink: SublinkId) {
        self.inner.lock().sublinks.remove(&sublink);
    }

    /// The router bound to `sublink`, if any.
    pub(crate) fn router_for_sublink(&self, sublink: SublinkId) -> Option<Arc<Router>> {
        self.inner
            .lock()
            .sublinks
            .get(&sublink)
            .map(|entry| entry.receiver.clone())
    }

    /// The remote link object bound to `sublink`, if any.
    pub(crate) fn link_for_sublink(&self, sublink: SublinkId) -> Option<Arc<RemoteRouterLink>> {
        self.inner
            .lock()
            .sublinks
            .get(&sublink)
            .map(|entry| entry.link.clone())
    }

    fn sublink_entry(&self, sublink: SublinkId) -> Option<(Arc<RemoteRouterLink>, Arc<Router>)> {
        self.inner
            .lock()
            .sublinks
            .get(&sublink)
            .map(|entry| (entry.link.clone(), entry.receiver.clone()))
    }

    /// Frames and transmits one message.
    pub(crate) fn transmit(&self, body: wire::Body) {
        self.transmit_with_handles(body, Vec::new());
    }

    /// Frames and transmits one message with out-of-band handles.
    pub(crate) fn transmit_with_handles(&self, body: wire::Body, handles: Vec<DriverHandle>) {
        let transport_seq = self.next_transport_seq.fetch_add(1, Ordering::SeqCst);
        let frame = match wire::encode_frame(transport_seq, &body) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "dropping unencodable frame");
                return;
            }
        };
        if let Err(error) = self.transport.transmit(&frame, handles) {
            tracing::warn!(%error, remote = %self.remote_name, "transport failed");
            if let Some(this) = self.strong() {
                this.deactivate();
            }
        }
    }

    /// Sends a bypass request to this link's remote node on behalf of
    /// `new_peer`, whose proxy sits between them. The request goes on the
    /// wire *before* the router adopts the new link, so the remote side
    /// knows the sublink before any parcel can arrive on it.
    pub(crate) fn bypass_proxy(
        self: &Arc<Self>,
        proxy_name: NodeName,
        proxy_sublink: SublinkId,
        proxy_outbound_length: SequenceNumber,
        new_peer: Arc<Router>,
        key: Option<BypassKey>,
    ) {
        let new_sublink = self.allocate_sublink();
        let link_state = self.memory.allocate_router_link_state();
        let (state_for_link, carried_state) = match link_state {
            Some(state) => {
                let carried = state.clone_ref();
                (Some(state), carried)
            }
            None => (None, None),
        };
        let new_link = self.add_remote_router_link(
            new_sublink,
            state_for_link,
            LinkType::Central,
            LinkSide::A,
            new_peer.clone(),
        );

        self.transmit(wire::Body::BypassProxy(wire::BypassProxy {
            proxy_name,
            proxy_sublink,
            new_sublink,
            new_link_state: carried_state
                .map(|carried| carried.release())
                .unwrap_or_default(),
            bypass_key: key.map(|key| key.to_bytes()).unwrap_or([0u8; 16]),
            proxy_outbound_sequence_length: proxy_outbound_length,
        }));

        new_peer.set_outward_link(new_link);
    }

    /// Announces a fresh allocator buffer to the peer.
    pub(crate) fn announce_allocator_buffer(
        &self,
        buffer_id: weft_core::BufferId,
        fragment_size: u32,
        region: SharedRegion,
    ) {
        self.transmit_with_handles(
            wire::Body::AddFragmentAllocatorBuffer(wire::AddFragmentAllocatorBuffer {
                buffer_id,
                fragment_size,
            }),
            vec![DriverHandle::Memory(region)],
        );
    }

    /// Asks the remote node to allocate shared memory on our behalf.
    pub(crate) fn request_memory(&self, size: u32, callback: MemoryCallback) {
        self.inner.lock().pending_memory.push((size, callback));
        self.transmit(wire::Body::RequestMemory(wire::RequestMemory { size }));
    }

    /// Permanently tears this link down: the transport stops, every bound
    /// router observes a disconnect, and the owning node forgets the link.
    pub(crate) fn deactivate(self: &Arc<Self>) {
        let (sublinks, pending_memory) = {
            let mut inner = self.inner.lock();
            if !inner.active {
                return;
            }
            inner.active = false;
            (
                std::mem::take(&mut inner.sublinks),
                std::mem::take(&mut inner.pending_memory),
            )
        };
        self.transport.deactivate();
        self.node.forget_link(self);
        for (_, callback) in pending_memory {
            callback(None);
        }
        for (sublink, entry) in sublinks {
            entry.receiver.notify_link_disconnected(self, sublink);
        }
    }

    fn protocol_error(self: &Arc<Self>, reason: &str) {
        tracing::warn!(remote = %self.remote_name, reason, "protocol error; dropping link");
        self.deactivate();
    }

    fn drain_incoming(self: &Arc<Self>) {
        loop {
            let frame = {
                let mut inner = self.inner.lock();
                if inner.dispatching || !inner.active {
                    return;
                }
                match inner.incoming.pop() {
                    Some(frame) => {
                        inner.dispatching = true;
                        frame
                    }
                    None => return,
                }
            };
            self.dispatch_frame(frame);
            self.inner.lock().dispatching = false;
        }
    }

    fn dispatch_frame(self: &Arc<Self>, frame: IncomingFrame) {
        let IncomingFrame { body, mut handles } = frame;
        match body {
            wire::Body::Connect(_) => {
                self.protocol_error("unexpected connect on established link");
            }
            wire::Body::RouteClosed(message) => {
                let Some((link, router)) = self.sublink_entry(message.sublink) else {
                    return;
                };
                if message.sequence_length == wire::DISCONNECT_SEQUENCE_LENGTH {
                    router.accept_route_disconnection(link.link_type());
                } else {
                    router.accept_route_closure(link.link_type(), message.sequence_length);
                }
            }
            wire::Body::RequestIntroduction(message) => {
                self.node.handle_request_introduction(self, message.name);
            }
            wire::Body::IntroduceNode(message) => {
                self.node
                    .handle_introduce_node(self, &message, std::mem::take(&mut handles));
            }
            wire::Body::InitiateProxyBypass(message) => {
                let Some(router) = self.router_for_sublink(message.sublink) else {
                    return;
                };
                let key = if message.bypass_key == [0u8; 16] {
                    None
                } else {
                    Some(BypassKey::from_bytes(message.bypass_key))
                };
                if !router.initiate_proxy_bypass(
                    self,
                    message.sublink,
                    message.proxy_peer_name,
                    message.proxy_peer_sublink,
                    key,
                ) {
                    self.protocol_error("bad bypass initiation");
                }
            }
            wire::Body::BypassProxy(message) => {
                let Some(link_to_proxy) = self.node.link_to(message.proxy_name) else {
                    tracing::warn!(proxy = %message.proxy_name, "bypass names unknown proxy node");
                    return;
                };
                let Some(router) = link_to_proxy.router_for_sublink(message.proxy_sublink)
                else {
                    return;
                };
                let link_state = if message.new_link_state.is_null() {
                    None
                } else {
                    self.memory.adopt_fragment(message.new_link_state)
                };
                let new_link = self.add_remote_router_link(
                    message.new_sublink,
                    link_state,
                    LinkType::Central,
                    LinkSide::B,
                    router.clone(),
                );
                let key = if message.bypass_key == [0u8; 16] {
                    None
                } else {
                    Some(BypassKey::from_bytes(message.bypass_key))
                };
                if !router.bypass_proxy_with_new_remote_link(
                    new_link,
                    message.proxy_outbound_sequence_length,
                    key.as_ref(),
                ) {
                    self.protocol_error("bad bypass request");
                }
            }
            wire::Body::BypassProxyToSameNode(message) => {
                let Some(router) = self.router_for_sublink(message.sublink) else {
                    return;
                };
                let link_state = if message.new_link_state.is_null() {
                    None
                } else {
                    self.memory.adopt_fragment(message.new_link_state)
                };
                let new_link = self.add_remote_router_link(
                    message.new_sublink,
                    link_state,
                    LinkType::Central,
                    LinkSide::B,
                    router.clone(),
                );
                if !router.bypass_proxy_with_new_link_to_same_node(
                    new_link,
                    message.proxy_inbound_sequence_length,
                ) {
                    self.protocol_error("bad same-node bypass");
                }
            }
            wire::Body::StopProxying(message) => {
                if let Some(router) = self.router_for_sublink(message.sublink) {
                    router.stop_proxying(
                        message.proxy_inbound_sequence_length,
                        message.proxy_outbound_sequence_length,
                    );
                }
            }
            wire::Body::StopProxyingToLocalPeer(message) => {
                if let Some(router) = self.router_for_sublink(message.sublink) {
                    router.stop_proxying_to_local_peer(message.proxy_outbound_sequence_length);
                }
            }
            wire::Body::ProxyWillStop(message) => {
                if let Some(router) = self.router_for_sublink(message.sublink) {
                    router.on_proxy_will_stop(message.proxy_inbound_sequence_length);
                }
            }
            wire::Body::DecayUnblocked(message) => {
                if let Some(router) = self.router_for_sublink(message.sublink) {
                    router.flush(true);
                }
            }
            wire::Body::FlushRouter(message) => {
                if let Some(router) = self.router_for_sublink(message.sublink) {
                    router.flush(true);
                }
            }
            wire::Body::FlushLink(message) => {
                if let Some((link, router)) = self.sublink_entry(message.sublink) {
                    link.share_link_state_if_necessary();
                    router.flush(true);
                }
            }
            wire::Body::LogRouteTrace(message) => {
                if let Some((link, router)) = self.sublink_entry(message.sublink) {
                    router.accept_log_route_trace(link.link_type());
                }
            }
            wire::Body::AcceptParcel(message) => {
                if message.num_handles as usize != handles.len() {
                    self.protocol_error("parcel handle count mismatch");
                    return;
                }
                let Some((link, router)) = self.sublink_entry(message.sublink) else {
                    return;
                };
                let mut routers = Vec::with_capacity(message.descriptors.len());
                for descriptor in &message.descriptors {
                    match Router::deserialize(descriptor, self) {
                        Some(router) => routers.push(router),
                        None => {
                            self.protocol_error("undeserializable router descriptor");
                            return;
                        }
                    }
                }
                let mut parcel = Parcel::with_attachments(
                    bytes::Bytes::from(message.data),
                    routers,
                    std::mem::take(&mut handles),
                );
                parcel.set_sequence_number(message.sequence_number);
                if link.link_type().is_peripheral_inward() {
                    router.accept_outbound_parcel(parcel);
                } else {
                    router.accept_inbound_parcel(parcel);
                }
            }
            wire::Body::AddFragmentAllocatorBuffer(message) => {
                let Some(DriverHandle::Memory(region)) =
                    (!handles.is_empty()).then(|| handles.remove(0))
                else {
                    self.protocol_error("allocator buffer without memory handle");
                    return;
                };
                if !self
                    .memory
                    .add_allocator_buffer(message.buffer_id, message.fragment_size, region)
                {
                    self.protocol_error("duplicate allocator buffer");
                }
            }
            wire::Body::RequestMemory(message) => {
                let region = self.node.allocate_region(message.size as usize).ok();
                let mut reply_handles = Vec::new();
                if let Some(region) = region {
                    reply_handles.push(DriverHandle::Memory(region));
                }
                self.transmit_with_handles(
                    wire::Body::ProvideMemory(wire::ProvideMemory { size: message.size }),
                    reply_handles,
                );
            }
            wire::Body::ProvideMemory(message) => {
                let region = match (!handles.is_empty()).then(|| handles.remove(0)) {
                    Some(DriverHandle::Memory(region)) => Some(region),
                    _ => None,
                };
                let callback = {
                    let mut inner = self.inner.lock();
                    match inner
                        .pending_memory
                        .iter()
                        .position(|(size, _)| *size == message.size)
                    {
                        Some(index) => Some(inner.pending_memory.remove(index).1),
                        None => None,
                    }
                };
                match callback {
                    Some(callback) => callback(region),
                    None => tracing::warn!("unsolicited memory grant"),
                }
            }
            wire::Body::SetRouterLinkStateFragment(message) => {
                let Some((link, _)) = self.sublink_entry(message.sublink) else {
                    return;
                };
                if let Some(fragment) = self.memory.adopt_fragment(message.descriptor) {
                    link.set_link_state(fragment);
                }
            }
        }
    }
}

impl ActivityHandler for NodeLink {
    fn on_message(&self, data: &[u8], handles: Vec<DriverHandle>) {
        let Some(this) = self.strong() else {
            return;
        };
        let (header, body) = match wire::decode_frame(data) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(%error, "undecodable frame");
                this.protocol_error("undecodable frame");
                return;
            }
        };
        if header.version != wire::PROTOCOL_VERSION {
            this.protocol_error("unsupported protocol version");
            return;
        }
        {
            let mut inner = this.inner.lock();
            if !inner.active {
                return;
            }
            if inner
                .incoming
                .push(
                    SequenceNumber::new(header.transport_seq),
                    IncomingFrame { body, handles },
                )
                .is_err()
            {
                drop(inner);
                this.protocol_error("replayed or out-of-window transport sequence");
                return;
            }
        }
        this.drain_incoming();
    }

    fn on_error(&self) {
        if let Some(this) = self.strong() {
            this.deactivate();
        }
    }
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("side", &self.side)
            .field("local", &self.local_name.to_string())
            .field("remote", &self.remote_name.to_string())
            .finish()
    }
}
