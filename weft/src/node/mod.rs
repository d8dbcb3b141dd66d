//! A participant in the fabric: a registry of live node links.

pub mod link;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{
    ActivityHandler, Driver, DriverError, DriverHandle, LinkSide, NodeName, SharedRegion,
    Transport,
};

use crate::link::LinkType;
use crate::portal::Portal;
use crate::router::Router;
use crate::wire;
use crate::PortalError;
use link::NodeLink;
use memory::{NodeLinkMemory, NUM_INITIAL_LINK_STATES};

/// Whether a node may introduce other nodes to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Trusted to introduce pairs of other nodes and to provide shared
    /// memory on request.
    Broker,
    /// An ordinary node. Its first connection is to its broker.
    Normal,
}

/// Tunables for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Fixed node name; a random one is generated when absent. Mostly
    /// useful to make tests deterministic.
    pub name: Option<NodeName>,
    /// Route shared-memory allocation through the broker instead of the
    /// local driver, for drivers that cannot allocate (e.g. sandboxed
    /// processes).
    pub request_memory_from_broker: bool,
}

impl NodeConfig {
    /// Configuration for a node whose driver cannot allocate memory.
    pub fn sandboxed() -> Self {
        Self {
            name: None,
            request_memory_from_broker: true,
        }
    }
}

type IntroductionCallback = Box<dyn FnOnce(Option<Arc<NodeLink>>) + Send>;

struct NodeInner {
    links: HashMap<NodeName, Arc<NodeLink>>,
    broker: Option<Arc<NodeLink>>,
    pending_introductions: HashMap<NodeName, Vec<IntroductionCallback>>,
}

/// One node in the mesh.
pub struct Node {
    driver: Arc<dyn Driver>,
    node_type: NodeType,
    name: NodeName,
    config: NodeConfig,
    inner: Mutex<NodeInner>,
}

impl Node {
    /// Creates a node backed by `driver`.
    pub fn create(driver: Arc<dyn Driver>, node_type: NodeType, config: NodeConfig) -> Arc<Node> {
        let name = config.name.unwrap_or_else(NodeName::random);
        Arc::new(Node {
            driver,
            node_type,
            name,
            config,
            inner: Mutex::new(NodeInner {
                links: HashMap::new(),
                broker: None,
                pending_introductions: HashMap::new(),
            }),
        })
    }

    /// This node's name.
    pub fn name(&self) -> NodeName {
        self.name
    }

    /// Whether this node is a broker.
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Opens a fresh connected portal pair on this node.
    pub fn open_portals(self: &Arc<Self>) -> (Portal, Portal) {
        let (first, second) = Router::new_pair();
        (Portal::new(first), Portal::new(second))
    }

    /// Connects this node to a peer over `transport`, returning
    /// `num_initial_portals` portals whose peers are the other side's
    /// initial portals. Portals buffer traffic until the greeting
    /// completes.
    pub fn connect_node(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        num_initial_portals: usize,
    ) -> Result<Vec<Portal>, PortalError> {
        if num_initial_portals > NUM_INITIAL_LINK_STATES {
            return Err(PortalError::InvalidArgument {
                reason: "too many initial portals",
            });
        }

        let Ok(region) = self.allocate_region(memory::PRIMARY_BUFFER_SIZE) else {
            return Err(PortalError::ResourceExhausted);
        };
        if !NodeLinkMemory::initialize_primary_region(&region) {
            return Err(PortalError::ResourceExhausted);
        }

        let routers: Vec<Arc<Router>> = (0..num_initial_portals)
            .map(|_| Router::new_buffering(weft_core::LinkSide::B))
            .collect();

        let connector = Arc::new(Connector {
            node: self.clone(),
            transport: transport.clone(),
            state: Mutex::new(ConnectorState {
                our_region: Some(region.clone()),
                routers: routers.clone(),
                num_initial_portals,
                link: None,
            }),
        });
        transport
            .activate(connector)
            .map_err(|_| PortalError::FailedPrecondition {
                reason: "transport cannot be activated",
            })?;

        // Greeting carries our name and our proposed primary buffer; the
        // side with the greater name wins the buffer election.
        let greeting = wire::Body::Connect(wire::Connect {
            name: self.name,
            protocol_version: wire::PROTOCOL_VERSION as u32,
            num_initial_portals: num_initial_portals as u32,
            has_primary_buffer: true,
        });
        match wire::encode_frame(0, &greeting) {
            Ok(frame) => {
                let _ = transport.transmit(&frame, vec![DriverHandle::Memory(region)]);
            }
            Err(_) => {
                return Err(PortalError::FailedPrecondition {
                    reason: "greeting could not be framed",
                })
            }
        }

        Ok(routers.into_iter().map(Portal::new).collect())
    }

    /// Deactivates every link. Routers with remote peers observe peer
    /// closure.
    pub fn shutdown(&self) {
        let links: Vec<Arc<NodeLink>> = {
            let inner = self.inner.lock();
            inner.links.values().cloned().collect()
        };
        for link in links {
            link.deactivate();
        }
    }

    pub(crate) fn allocate_region(&self, len: usize) -> Result<SharedRegion, DriverError> {
        self.driver.allocate_shared_memory(len)
    }

    /// Allocates shared memory, possibly by asking the broker, invoking
    /// `callback` when done.
    pub(crate) fn allocate_region_async(
        self: &Arc<Self>,
        len: usize,
        callback: Box<dyn FnOnce(Option<SharedRegion>) + Send>,
    ) {
        if !self.config.request_memory_from_broker {
            callback(self.allocate_region(len).ok());
            return;
        }
        let broker = self.inner.lock().broker.clone();
        match broker {
            Some(broker) => broker.request_memory(len as u32, callback),
            None => callback(None),
        }
    }

    pub(crate) fn link_to(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        self.inner.lock().links.get(&name).cloned()
    }

    /// Produces a link to `name`, asking the broker for an introduction
    /// when none exists. The callback runs inline when the link is already
    /// known.
    pub(crate) fn establish_link(self: &Arc<Self>, name: NodeName, callback: IntroductionCallback) {
        let request_via = {
            let mut inner = self.inner.lock();
            if let Some(link) = inner.links.get(&name) {
                let link = link.clone();
                drop(inner);
                callback(Some(link));
                return;
            }
            match inner.pending_introductions.get_mut(&name) {
                Some(waiters) => {
                    waiters.push(callback);
                    None
                }
                None => match inner.broker.clone() {
                    Some(broker) => {
                        inner.pending_introductions.insert(name, vec![callback]);
                        Some(broker)
                    }
                    None => {
                        drop(inner);
                        callback(None);
                        return;
                    }
                },
            }
        };
        if let Some(broker) = request_via {
            broker.transmit(wire::Body::RequestIntroduction(wire::RequestIntroduction {
                name,
            }));
        }
    }

    pub(crate) fn adopt_link(&self, link: &Arc<NodeLink>) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.links.insert(link.remote_name(), link.clone());
            if self.node_type == NodeType::Normal && inner.broker.is_none() {
                // A normal node's first connection is its broker.
                inner.broker = Some(link.clone());
            }
            inner
                .pending_introductions
                .remove(&link.remote_name())
                .unwrap_or_default()
        };
        for callback in waiters {
            callback(Some(link.clone()));
        }
    }

    pub(crate) fn forget_link(&self, link: &Arc<NodeLink>) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.links.get(&link.remote_name()) {
            if Arc::ptr_eq(existing, link) {
                inner.links.remove(&link.remote_name());
            }
        }
        if inner
            .broker
            .as_ref()
            .is_some_and(|broker| Arc::ptr_eq(broker, link))
        {
            inner.broker = None;
        }
    }

    /// Broker-side handling of an introduction request.
    pub(crate) fn handle_request_introduction(
        self: &Arc<Self>,
        from: &Arc<NodeLink>,
        name: NodeName,
    ) {
        if self.node_type != NodeType::Broker {
            tracing::warn!("introduction requested from a non-broker");
            return;
        }
        let target = self.link_to(name);
        let Some(target) = target else {
            from.transmit(wire::Body::IntroduceNode(wire::IntroduceNode {
                name,
                known: false,
            }));
            return;
        };

        let Ok((transport_for_requester, transport_for_target)) =
            self.driver.create_transports()
        else {
            from.transmit(wire::Body::IntroduceNode(wire::IntroduceNode {
                name,
                known: false,
            }));
            return;
        };
        let Ok(region) = self.allocate_region(memory::PRIMARY_BUFFER_SIZE) else {
            from.transmit(wire::Body::IntroduceNode(wire::IntroduceNode {
                name,
                known: false,
            }));
            return;
        };
        if !NodeLinkMemory::initialize_primary_region(&region) {
            return;
        }

        from.transmit_with_handles(
            wire::Body::IntroduceNode(wire::IntroduceNode { name, known: true }),
            vec![
                DriverHandle::Transport(transport_for_requester),
                DriverHandle::Memory(region.clone()),
            ],
        );
        target.transmit_with_handles(
            wire::Body::IntroduceNode(wire::IntroduceNode {
                name: from.remote_name(),
                known: true,
            }),
            vec![
                DriverHandle::Transport(transport_for_target),
                DriverHandle::Memory(region),
            ],
        );
    }

    /// Handles an introduction delivered by the broker.
    pub(crate) fn handle_introduce_node(
        self: &Arc<Self>,
        from: &Arc<NodeLink>,
        message: &wire::IntroduceNode,
        mut handles: Vec<DriverHandle>,
    ) {
        let is_broker_link = self
            .inner
            .lock()
            .broker
            .as_ref()
            .is_some_and(|broker| Arc::ptr_eq(broker, from));
        if !is_broker_link {
            tracing::warn!("ignoring introduction from a non-broker link");
            return;
        }

        if !message.known {
            let waiters = self
                .inner
                .lock()
                .pending_introductions
                .remove(&message.name)
                .unwrap_or_default();
            for callback in waiters {
                callback(None);
            }
            return;
        }

        if self.link_to(message.name).is_some() {
            // Already linked; nothing to adopt.
            return;
        }
        if handles.len() < 2 {
            tracing::warn!("introduction missing its transport or buffer");
            return;
        }
        let DriverHandle::Transport(transport) = handles.remove(0) else {
            tracing::warn!("introduction handle 0 is not a transport");
            return;
        };
        let DriverHandle::Memory(region) = handles.remove(0) else {
            tracing::warn!("introduction handle 1 is not a memory region");
            return;
        };
        let Some(memory) = NodeLinkMemory::adopt(self.clone(), region) else {
            tracing::warn!("introduction carried an unusable primary buffer");
            return;
        };

        let side = if self.name > message.name {
            LinkSide::A
        } else {
            LinkSide::B
        };
        let link = NodeLink::create(
            self.clone(),
            side,
            self.name,
            message.name,
            transport.clone(),
            memory.clone(),
            0,
        );
        memory.set_node_link(&link);
        self.adopt_link(&link);
        if transport.activate(link).is_err() {
            tracing::warn!("introduced transport refused activation");
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name.to_string())
            .field("type", &self.node_type)
            .finish()
    }
}

struct ConnectorState {
    our_region: Option<SharedRegion>,
    routers: Vec<Arc<Router>>,
    num_initial_portals: usize,
    link: Option<Arc<NodeLink>>,
}

/// Transitional activity handler driving the connection greeting; hands
/// the transport off to the node link it constructs.
struct Connector {
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectorState>,
}

impl Connector {
    fn fail(&self, reason: &str) {
        tracing::warn!(reason, "connection failed");
        let routers = {
            let mut state = self.state.lock();
            state.our_region = None;
            std::mem::take(&mut state.routers)
        };
        self.transport.deactivate();
        for router in routers {
            router.accept_route_disconnection(LinkType::PeripheralOutward);
        }
    }
}

impl ActivityHandler for Connector {
    fn on_message(&self, data: &[u8], mut handles: Vec<DriverHandle>) {
        {
            // Frames that race the handoff are forwarded to the link.
            let state = self.state.lock();
            if let Some(link) = &state.link {
                let link = link.clone();
                drop(state);
                link.on_message(data, handles);
                return;
            }
        }

        let connect = match wire::decode_frame(data) {
            Ok((_, wire::Body::Connect(connect))) => connect,
            Ok(_) => {
                self.fail("peer spoke before the greeting");
                return;
            }
            Err(_) => {
                self.fail("undecodable greeting");
                return;
            }
        };

        let peer_region = if connect.has_primary_buffer {
            match (!handles.is_empty()).then(|| handles.remove(0)) {
                Some(DriverHandle::Memory(region)) => Some(region),
                _ => {
                    self.fail("greeting promised a buffer it did not carry");
                    return;
                }
            }
        } else {
            None
        };

        let node = self.node.clone();
        if connect.name == node.name() || !connect.name.is_valid() {
            self.fail("peer presented an unusable name");
            return;
        }

        // The greater name is authoritative: it takes side A and its
        // buffer backs the link.
        let our_side = if node.name() > connect.name {
            LinkSide::A
        } else {
            LinkSide::B
        };
        let (routers, our_region, our_count) = {
            let mut state = self.state.lock();
            (
                state.routers.clone(),
                state.our_region.take(),
                state.num_initial_portals,
            )
        };
        let chosen_region = match (our_side, peer_region, our_region) {
            (LinkSide::A, _, Some(ours)) => ours,
            (LinkSide::B, Some(theirs), _) => theirs,
            (_, Some(theirs), None) => theirs,
            (_, None, Some(ours)) => ours,
            (_, None, None) => {
                self.fail("no primary buffer from either side");
                return;
            }
        };
        let Some(memory) = NodeLinkMemory::adopt(node.clone(), chosen_region) else {
            self.fail("unusable primary buffer");
            return;
        };

        let paired = our_count.min(connect.num_initial_portals as usize);
        let link = NodeLink::create(
            node.clone(),
            our_side,
            node.name(),
            connect.name,
            self.transport.clone(),
            memory.clone(),
            paired as u64,
        );
        memory.set_node_link(&link);
        node.adopt_link(&link);
        self.state.lock().link = Some(link.clone());

        // Wire the initial portals: both sides derive the same sublink and
        // link-state slot for portal i. Extras beyond the common count see
        // immediate closure.
        for (i, router) in routers.iter().enumerate() {
            if i < paired {
                router.set_side(our_side);
                let sublink = NodeLink::initial_portal_sublink(i as u64);
                let state = memory.initial_router_link_state(i);
                let remote_link = link.add_remote_router_link(
                    sublink,
                    state,
                    LinkType::Central,
                    our_side,
                    router.clone(),
                );
                router.set_outward_link(remote_link);
            } else {
                router.accept_route_closure(LinkType::Central, weft_core::SequenceNumber::ZERO);
            }
        }

        // Subsequent frames go straight to the link.
        if self.transport.activate(link).is_err() {
            self.fail("transport handoff failed");
        }
    }

    fn on_error(&self) {
        self.fail("transport error during greeting");
    }
}
