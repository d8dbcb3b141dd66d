//! Wire format for node link frames.
//!
//! Frame format: `[size:2][message_id:1][version:1][transport_seq:8][body…]`
//!
//! - **size**: total frame length including the header (little-endian u16)
//! - **message_id**: selects the body layout
//! - **version**: layout version, currently 0
//! - **transport_seq**: sender-assigned ordering number; the receiver
//!   dispatches frames in this order regardless of transport reordering
//!
//! Bodies are fixed-layout little-endian. Variable-length regions sit after
//! the fixed body and are referenced by `(offset, count)` pairs measured
//! from the start of the frame. Driver handles never appear in the framed
//! bytes; they travel out-of-band in the transport's parallel handle array.

use weft_core::{BufferId, LinkSide, NodeName, SequenceNumber, SublinkId};

use crate::link::state::BypassKey;
use crate::node::memory::FragmentDescriptor;
use crate::router::descriptor::RouterDescriptor;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Frame header size: 2 (size) + 1 (id) + 1 (version) + 8 (seq).
pub const HEADER_SIZE: usize = 12;

/// Hard frame bound imposed by the 16-bit size field.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Serialized size of one router descriptor.
pub const DESCRIPTOR_WIRE_SIZE: usize = 112;

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The message id names no known body layout.
    #[error("unknown message id {id}")]
    UnknownMessage {
        /// The offending id.
        id: u8,
    },

    /// A field or region reference is inconsistent with the frame.
    #[error("malformed body: {reason}")]
    MalformedBody {
        /// What failed to validate.
        reason: &'static str,
    },

    /// The encoded frame would exceed the 16-bit size field.
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge {
        /// Attempted frame size.
        size: usize,
    },
}

/// Message ids. Ids 0–12 are fixed by the protocol; the remainder extend
/// the space for router- and memory-scoped traffic.
pub mod message_id {
    /// Connection greeting.
    pub const CONNECT: u8 = 0;
    /// A route side closed at a given sequence length.
    pub const ROUTE_CLOSED: u8 = 2;
    /// Ask the broker to introduce a named node.
    pub const REQUEST_INTRODUCTION: u8 = 3;
    /// Broker-provided transport + primary buffer for a named node.
    pub const INTRODUCE_NODE: u8 = 4;
    /// Proxy hands its successor the means to bypass it.
    pub const INITIATE_PROXY_BYPASS: u8 = 5;
    /// Successor asks the proxy's outward peer to go direct.
    pub const BYPASS_PROXY: u8 = 6;
    /// Same-node bypass variant.
    pub const BYPASS_PROXY_TO_SAME_NODE: u8 = 7;
    /// Outward peer tells the proxy when it may retire.
    pub const STOP_PROXYING: u8 = 8;
    /// Same-node retirement reply.
    pub const STOP_PROXYING_TO_LOCAL_PEER: u8 = 9;
    /// Proxy tells its new direct peer what is still in flight.
    pub const PROXY_WILL_STOP: u8 = 10;
    /// Nudge a stalled proxy to re-examine its decay.
    pub const DECAY_UNBLOCKED: u8 = 11;
    /// Debug route tracing.
    pub const LOG_ROUTE_TRACE: u8 = 12;
    /// A parcel for a sublink-bound router.
    pub const ACCEPT_PARCEL: u8 = 13;
    /// Register a new shared allocator buffer.
    pub const ADD_FRAGMENT_ALLOCATOR_BUFFER: u8 = 14;
    /// Ask the peer to allocate shared memory on our behalf.
    pub const REQUEST_MEMORY: u8 = 15;
    /// Reply to [`REQUEST_MEMORY`].
    pub const PROVIDE_MEMORY: u8 = 16;
    /// Tell side B where its link state lives.
    pub const SET_ROUTER_LINK_STATE_FRAGMENT: u8 = 17;
    /// Wake a router to re-examine its queues.
    pub const FLUSH_ROUTER: u8 = 18;
    /// Wake a router to re-examine its link state.
    pub const FLUSH_LINK: u8 = 19;
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including this header.
    pub size: u16,
    /// Body layout selector.
    pub message_id: u8,
    /// Layout version.
    pub version: u8,
    /// Sender-assigned ordering number.
    pub transport_seq: u64,
}

/// Connection greeting. The optional primary buffer travels as handle 0.
#[derive(Debug, Clone)]
pub struct Connect {
    /// Sender's node name.
    pub name: NodeName,
    /// Sender's protocol version.
    pub protocol_version: u32,
    /// Initial portal pairs the sender expects.
    pub num_initial_portals: u32,
    /// Whether handle 0 carries the sender's proposed primary buffer.
    pub has_primary_buffer: bool,
}

/// Sentinel `sequence_length` in [`RouteClosed`] signalling an unexpected
/// disconnection: the sequence ends wherever it happens to end, and
/// parcels past that point are reported lost rather than awaited.
pub const DISCONNECT_SEQUENCE_LENGTH: SequenceNumber = SequenceNumber::new(u64::MAX);

/// A route side closed after sending `sequence_length` parcels.
#[derive(Debug, Clone, Copy)]
pub struct RouteClosed {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// Final sequence length of the closed side.
    pub sequence_length: SequenceNumber,
}

/// Ask the broker for an introduction to `name`.
#[derive(Debug, Clone, Copy)]
pub struct RequestIntroduction {
    /// The node to introduce.
    pub name: NodeName,
}

/// Introduction result. When `known`, handle 0 is a transport to the named
/// node and handle 1 the primary buffer for the new link.
#[derive(Debug, Clone, Copy)]
pub struct IntroduceNode {
    /// The introduced node.
    pub name: NodeName,
    /// False when the broker does not know the node.
    pub known: bool,
}

/// Proxy → successor: everything needed to bypass the proxy.
#[derive(Debug, Clone, Copy)]
pub struct InitiateProxyBypass {
    /// Addressed sublink (the proxy↔successor link).
    pub sublink: SublinkId,
    /// Node hosting the proxy's outward peer.
    pub proxy_peer_name: NodeName,
    /// Sublink identifying the proxy↔peer link on that node.
    pub proxy_peer_sublink: SublinkId,
    /// Credential the successor must present to the peer.
    pub bypass_key: [u8; 16],
}

/// Successor → proxy's outward peer: authenticated request to go direct.
#[derive(Debug, Clone, Copy)]
pub struct BypassProxy {
    /// Node hosting the proxy being bypassed.
    pub proxy_name: NodeName,
    /// Sublink identifying the receiver's link to that proxy.
    pub proxy_sublink: SublinkId,
    /// Fresh sublink for the direct link, allocated by the sender.
    pub new_sublink: SublinkId,
    /// Shared state for the direct link, allocated by the sender.
    pub new_link_state: FragmentDescriptor,
    /// Credential the proxy stored for the sender's node.
    pub bypass_key: [u8; 16],
    /// Sequence length the sender had transmitted toward the proxy;
    /// everything at or past it arrives on the new link.
    pub proxy_outbound_sequence_length: SequenceNumber,
}

/// Proxy → successor, when the proxy's outward peer shares the proxy's
/// node: an unauthenticated bypass handing the successor a direct sublink
/// to that peer.
#[derive(Debug, Clone, Copy)]
pub struct BypassProxyToSameNode {
    /// Addressed sublink (the successor's link to the proxy).
    pub sublink: SublinkId,
    /// Fresh sublink directly to the proxy's local peer.
    pub new_sublink: SublinkId,
    /// Shared state for the new link.
    pub new_link_state: FragmentDescriptor,
    /// Inbound parcels below this length still arrive via the proxy.
    pub proxy_inbound_sequence_length: SequenceNumber,
}

/// Outward peer → proxy: both directions' final lengths; retire when done.
#[derive(Debug, Clone, Copy)]
pub struct StopProxying {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// Final length of the proxy's inbound direction.
    pub proxy_inbound_sequence_length: SequenceNumber,
    /// Final length of the proxy's outbound direction.
    pub proxy_outbound_sequence_length: SequenceNumber,
}

/// Same-node retirement reply carrying the outbound final length.
#[derive(Debug, Clone, Copy)]
pub struct StopProxyingToLocalPeer {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// Final length of the proxy's outbound direction.
    pub proxy_outbound_sequence_length: SequenceNumber,
}

/// Proxy → its replacement peer: inbound parcels beyond this length come
/// direct.
#[derive(Debug, Clone, Copy)]
pub struct ProxyWillStop {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// Final inbound length through the proxy.
    pub proxy_inbound_sequence_length: SequenceNumber,
}

/// Nudge a stalled proxy to re-examine its decay conditions.
#[derive(Debug, Clone, Copy)]
pub struct DecayUnblocked {
    /// Addressed sublink.
    pub sublink: SublinkId,
}

/// Debug: log the addressed router and forward along the route.
#[derive(Debug, Clone, Copy)]
pub struct LogRouteTrace {
    /// Addressed sublink.
    pub sublink: SublinkId,
}

/// A parcel addressed to a sublink-bound router. Attached portals ride as
/// router descriptors; driver handles ride out-of-band.
#[derive(Debug, Clone)]
pub struct AcceptParcel {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// The parcel's sequence number.
    pub sequence_number: SequenceNumber,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// One descriptor per attached portal.
    pub descriptors: Vec<RouterDescriptor>,
    /// Number of out-of-band handles belonging to this parcel.
    pub num_handles: u32,
}

/// Register a peer-allocated shared buffer for fragment allocation.
/// Handle 0 is the memory region.
#[derive(Debug, Clone, Copy)]
pub struct AddFragmentAllocatorBuffer {
    /// Id the buffer was assigned.
    pub buffer_id: BufferId,
    /// Fragment size its allocator serves.
    pub fragment_size: u32,
}

/// Ask the peer (typically the broker) to allocate shared memory.
#[derive(Debug, Clone, Copy)]
pub struct RequestMemory {
    /// Requested size in bytes.
    pub size: u32,
}

/// Reply to [`RequestMemory`]; handle 0 is the region.
#[derive(Debug, Clone, Copy)]
pub struct ProvideMemory {
    /// Size of the provided region.
    pub size: u32,
}

/// Tell the B side of a central link where its shared state lives.
#[derive(Debug, Clone, Copy)]
pub struct SetRouterLinkStateFragment {
    /// Addressed sublink.
    pub sublink: SublinkId,
    /// Location of the link state.
    pub descriptor: FragmentDescriptor,
}

/// Wake the addressed router to re-examine its queues.
#[derive(Debug, Clone, Copy)]
pub struct FlushRouter {
    /// Addressed sublink.
    pub sublink: SublinkId,
}

/// Wake the addressed router to re-examine its link's shared state.
#[derive(Debug, Clone, Copy)]
pub struct FlushLink {
    /// Addressed sublink.
    pub sublink: SublinkId,
}

/// A decoded frame body.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Body {
    Connect(Connect),
    RouteClosed(RouteClosed),
    RequestIntroduction(RequestIntroduction),
    IntroduceNode(IntroduceNode),
    InitiateProxyBypass(InitiateProxyBypass),
    BypassProxy(BypassProxy),
    BypassProxyToSameNode(BypassProxyToSameNode),
    StopProxying(StopProxying),
    StopProxyingToLocalPeer(StopProxyingToLocalPeer),
    ProxyWillStop(ProxyWillStop),
    DecayUnblocked(DecayUnblocked),
    LogRouteTrace(LogRouteTrace),
    AcceptParcel(AcceptParcel),
    AddFragmentAllocatorBuffer(AddFragmentAllocatorBuffer),
    RequestMemory(RequestMemory),
    ProvideMemory(ProvideMemory),
    SetRouterLinkStateFragment(SetRouterLinkStateFragment),
    FlushRouter(FlushRouter),
    FlushLink(FlushLink),
}

impl Body {
    /// The message id this body encodes as.
    pub fn message_id(&self) -> u8 {
        match self {
            Body::Connect(_) => message_id::CONNECT,
            Body::RouteClosed(_) => message_id::ROUTE_CLOSED,
            Body::RequestIntroduction(_) => message_id::REQUEST_INTRODUCTION,
            Body::IntroduceNode(_) => message_id::INTRODUCE_NODE,
            Body::InitiateProxyBypass(_) => message_id::INITIATE_PROXY_BYPASS,
            Body::BypassProxy(_) => message_id::BYPASS_PROXY,
            Body::BypassProxyToSameNode(_) => message_id::BYPASS_PROXY_TO_SAME_NODE,
            Body::StopProxying(_) => message_id::STOP_PROXYING,
            Body::StopProxyingToLocalPeer(_) => message_id::STOP_PROXYING_TO_LOCAL_PEER,
            Body::ProxyWillStop(_) => message_id::PROXY_WILL_STOP,
            Body::DecayUnblocked(_) => message_id::DECAY_UNBLOCKED,
            Body::LogRouteTrace(_) => message_id::LOG_ROUTE_TRACE,
            Body::AcceptParcel(_) => message_id::ACCEPT_PARCEL,
            Body::AddFragmentAllocatorBuffer(_) => {
                message_id::ADD_FRAGMENT_ALLOCATOR_BUFFER
            }
            Body::RequestMemory(_) => message_id::REQUEST_MEMORY,
            Body::ProvideMemory(_) => message_id::PROVIDE_MEMORY,
            Body::SetRouterLinkStateFragment(_) => {
                message_id::SET_ROUTER_LINK_STATE_FRAGMENT
            }
            Body::FlushRouter(_) => message_id::FLUSH_ROUTER,
            Body::FlushLink(_) => message_id::FLUSH_LINK,
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::InsufficientData {
                needed: self.pos + n,
                have: self.data.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(u16::from_le_bytes(bytes))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    fn array16(&mut self) -> Result<[u8; 16], WireError> {
        self.need(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 16]);
        self.pos += 16;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    fn name(&mut self) -> Result<NodeName, WireError> {
        Ok(NodeName::from_bytes(self.array16()?))
    }

    fn fragment(&mut self) -> Result<FragmentDescriptor, WireError> {
        Ok(FragmentDescriptor {
            buffer: BufferId(self.u64()?),
            offset: self.u32()?,
            size: self.u32()?,
        })
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_fragment(out: &mut Vec<u8>, fragment: &FragmentDescriptor) {
    put_u64(out, fragment.buffer.0);
    put_u32(out, fragment.offset);
    put_u32(out, fragment.size);
}

const DESCRIPTOR_FLAG_PEER_CLOSED: u8 = 1 << 0;
const DESCRIPTOR_FLAG_ALREADY_BYPASSED: u8 = 1 << 1;
const DESCRIPTOR_FLAG_PROXY_PEER: u8 = 1 << 2;

fn put_descriptor(out: &mut Vec<u8>, descriptor: &RouterDescriptor) {
    put_u64(out, descriptor.new_sublink.0);
    put_u64(out, descriptor.new_decaying_sublink.0);
    put_fragment(out, &descriptor.new_link_state);
    put_u64(out, descriptor.next_outgoing_sequence_number.value());
    put_u64(out, descriptor.next_incoming_sequence_number.value());
    put_u64(out, descriptor.decaying_incoming_sequence_length.value());
    put_u64(out, descriptor.closed_peer_sequence_length.value());
    out.extend_from_slice(&descriptor.proxy_peer_name.to_bytes());
    put_u64(out, descriptor.proxy_peer_sublink.0);
    out.extend_from_slice(
        &descriptor
            .bypass_key
            .map(|key| key.to_bytes())
            .unwrap_or([0u8; 16]),
    );
    out.push(if descriptor.side.is_a() { 0 } else { 1 });
    let mut flags = 0u8;
    if descriptor.peer_closed {
        flags |= DESCRIPTOR_FLAG_PEER_CLOSED;
    }
    if descriptor.proxy_already_bypassed {
        flags |= DESCRIPTOR_FLAG_ALREADY_BYPASSED;
    }
    if descriptor.proxy_peer_name.is_valid() {
        flags |= DESCRIPTOR_FLAG_PROXY_PEER;
    }
    out.push(flags);
    out.extend_from_slice(&[0u8; 6]);
}

fn read_descriptor(reader: &mut Reader<'_>) -> Result<RouterDescriptor, WireError> {
    let new_sublink = SublinkId(reader.u64()?);
    let new_decaying_sublink = SublinkId(reader.u64()?);
    let new_link_state = reader.fragment()?;
    let next_outgoing = SequenceNumber::new(reader.u64()?);
    let next_incoming = SequenceNumber::new(reader.u64()?);
    let decaying_incoming = SequenceNumber::new(reader.u64()?);
    let closed_peer = SequenceNumber::new(reader.u64()?);
    let proxy_peer_name = reader.name()?;
    let proxy_peer_sublink = SublinkId(reader.u64()?);
    let key_bytes = reader.array16()?;
    let side = match reader.u8()? {
        0 => LinkSide::A,
        1 => LinkSide::B,
        _ => {
            return Err(WireError::MalformedBody {
                reason: "invalid link side",
            })
        }
    };
    let flags = reader.u8()?;
    reader.skip(6)?;

    Ok(RouterDescriptor {
        new_sublink,
        new_decaying_sublink,
        new_link_state,
        side,
        next_outgoing_sequence_number: next_outgoing,
        next_incoming_sequence_number: next_incoming,
        decaying_incoming_sequence_length: decaying_incoming,
        peer_closed: flags & DESCRIPTOR_FLAG_PEER_CLOSED != 0,
        closed_peer_sequence_length: closed_peer,
        proxy_already_bypassed: flags & DESCRIPTOR_FLAG_ALREADY_BYPASSED != 0,
        proxy_peer_name: if flags & DESCRIPTOR_FLAG_PROXY_PEER != 0 {
            proxy_peer_name
        } else {
            NodeName::default()
        },
        proxy_peer_sublink,
        bypass_key: if key_bytes == [0u8; 16] {
            None
        } else {
            Some(BypassKey::from_bytes(key_bytes))
        },
    })
}

/// Encodes one frame.
pub fn encode_frame(transport_seq: u64, body: &Body) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    out.resize(HEADER_SIZE, 0);

    match body {
        Body::Connect(connect) => {
            out.extend_from_slice(&connect.name.to_bytes());
            put_u32(&mut out, connect.protocol_version);
            put_u32(&mut out, connect.num_initial_portals);
            put_u32(&mut out, u32::from(connect.has_primary_buffer));
        }
        Body::RouteClosed(closed) => {
            put_u64(&mut out, closed.sublink.0);
            put_u64(&mut out, closed.sequence_length.value());
        }
        Body::RequestIntroduction(request) => {
            out.extend_from_slice(&request.name.to_bytes());
        }
        Body::IntroduceNode(intro) => {
            out.extend_from_slice(&intro.name.to_bytes());
            put_u32(&mut out, u32::from(intro.known));
        }
        Body::InitiateProxyBypass(initiate) => {
            put_u64(&mut out, initiate.sublink.0);
            out.extend_from_slice(&initiate.proxy_peer_name.to_bytes());
            put_u64(&mut out, initiate.proxy_peer_sublink.0);
            out.extend_from_slice(&initiate.bypass_key);
        }
        Body::BypassProxy(bypass) => {
            out.extend_from_slice(&bypass.proxy_name.to_bytes());
            put_u64(&mut out, bypass.proxy_sublink.0);
            put_u64(&mut out, bypass.new_sublink.0);
            put_fragment(&mut out, &bypass.new_link_state);
            out.extend_from_slice(&bypass.bypass_key);
            put_u64(&mut out, bypass.proxy_outbound_sequence_length.value());
        }
        Body::BypassProxyToSameNode(bypass) => {
            put_u64(&mut out, bypass.sublink.0);
            put_u64(&mut out, bypass.new_sublink.0);
            put_fragment(&mut out, &bypass.new_link_state);
            put_u64(&mut out, bypass.proxy_inbound_sequence_length.value());
        }
        Body::StopProxying(stop) => {
            put_u64(&mut out, stop.sublink.0);
            put_u64(&mut out, stop.proxy_inbound_sequence_length.value());
            put_u64(&mut out, stop.proxy_outbound_sequence_length.value());
        }
        Body::StopProxyingToLocalPeer(stop) => {
            put_u64(&mut out, stop.sublink.0);
            put_u64(&mut out, stop.proxy_outbound_sequence_length.value());
        }
        Body::ProxyWillStop(will_stop) => {
            put_u64(&mut out, will_stop.sublink.0);
            put_u64(&mut out, will_stop.proxy_inbound_sequence_length.value());
        }
        Body::DecayUnblocked(message) => {
            put_u64(&mut out, message.sublink.0);
        }
        Body::LogRouteTrace(message) => {
            put_u64(&mut out, message.sublink.0);
        }
        Body::AcceptParcel(accept) => {
            // Fixed body, then the two variable regions: data bytes first,
            // descriptors after, both referenced by (offset, count).
            let fixed = HEADER_SIZE + 8 + 8 + 4 + 16;
            let data_offset = fixed;
            let descriptors_offset = data_offset + accept.data.len();
            put_u64(&mut out, accept.sublink.0);
            put_u64(&mut out, accept.sequence_number.value());
            put_u32(&mut out, accept.num_handles);
            put_u32(&mut out, data_offset as u32);
            put_u32(&mut out, accept.data.len() as u32);
            put_u32(&mut out, descriptors_offset as u32);
            put_u32(&mut out, accept.descriptors.len() as u32);
            out.extend_from_slice(&accept.data);
            for descriptor in &accept.descriptors {
                put_descriptor(&mut out, descriptor);
            }
        }
        Body::AddFragmentAllocatorBuffer(add) => {
            put_u64(&mut out, add.buffer_id.0);
            put_u32(&mut out, add.fragment_size);
        }
        Body::RequestMemory(request) => {
            put_u32(&mut out, request.size);
        }
        Body::ProvideMemory(provide) => {
            put_u32(&mut out, provide.size);
        }
        Body::SetRouterLinkStateFragment(set) => {
            put_u64(&mut out, set.sublink.0);
            put_fragment(&mut out, &set.descriptor);
        }
        Body::FlushRouter(flush) => {
            put_u64(&mut out, flush.sublink.0);
        }
        Body::FlushLink(flush) => {
            put_u64(&mut out, flush.sublink.0);
        }
    }

    let size = out.len();
    if size > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size });
    }
    out[0..2].copy_from_slice(&(size as u16).to_le_bytes());
    out[2] = body.message_id();
    out[3] = PROTOCOL_VERSION;
    out[4..12].copy_from_slice(&transport_seq.to_le_bytes());
    Ok(out)
}

/// Decodes one frame, validating the header and every region reference.
pub fn decode_frame(data: &[u8]) -> Result<(FrameHeader, Body), WireError> {
    let mut reader = Reader::new(data);
    let size = reader.u16()?;
    let message_id = reader.u8()?;
    let version = reader.u8()?;
    let transport_seq = reader.u64()?;
    if size as usize != data.len() {
        return Err(WireError::MalformedBody {
            reason: "size field disagrees with frame length",
        });
    }
    let header = FrameHeader {
        size,
        message_id,
        version,
        transport_seq,
    };

    let body = match message_id {
        message_id::CONNECT => Body::Connect(Connect {
            name: reader.name()?,
            protocol_version: reader.u32()?,
            num_initial_portals: reader.u32()?,
            has_primary_buffer: reader.u32()? != 0,
        }),
        message_id::ROUTE_CLOSED => Body::RouteClosed(RouteClosed {
            sublink: SublinkId(reader.u64()?),
            sequence_length: SequenceNumber::new(reader.u64()?),
        }),
        message_id::REQUEST_INTRODUCTION => {
            Body::RequestIntroduction(RequestIntroduction {
                name: reader.name()?,
            })
        }
        message_id::INTRODUCE_NODE => Body::IntroduceNode(IntroduceNode {
            name: reader.name()?,
            known: reader.u32()? != 0,
        }),
        message_id::INITIATE_PROXY_BYPASS => {
            Body::InitiateProxyBypass(InitiateProxyBypass {
                sublink: SublinkId(reader.u64()?),
                proxy_peer_name: reader.name()?,
                proxy_peer_sublink: SublinkId(reader.u64()?),
                bypass_key: reader.array16()?,
            })
        }
        message_id::BYPASS_PROXY => Body::BypassProxy(BypassProxy {
            proxy_name: reader.name()?,
            proxy_sublink: SublinkId(reader.u64()?),
            new_sublink: SublinkId(reader.u64()?),
            new_link_state: reader.fragment()?,
            bypass_key: reader.array16()?,
            proxy_outbound_sequence_length: SequenceNumber::new(reader.u64()?),
        }),
        message_id::BYPASS_PROXY_TO_SAME_NODE => {
            Body::BypassProxyToSameNode(BypassProxyToSameNode {
                sublink: SublinkId(reader.u64()?),
                new_sublink: SublinkId(reader.u64()?),
                new_link_state: reader.fragment()?,
                proxy_inbound_sequence_length: SequenceNumber::new(reader.u64()?),
            })
        }
        message_id::STOP_PROXYING => Body::StopProxying(StopProxying {
            sublink: SublinkId(reader.u64()?),
            proxy_inbound_sequence_length: SequenceNumber::new(reader.u64()?),
            proxy_outbound_sequence_length: SequenceNumber::new(reader.u64()?),
        }),
        message_id::STOP_PROXYING_TO_LOCAL_PEER => {
            Body::StopProxyingToLocalPeer(StopProxyingToLocalPeer {
                sublink: SublinkId(reader.u64()?),
                proxy_outbound_sequence_length: SequenceNumber::new(reader.u64()?),
            })
        }
        message_id::PROXY_WILL_STOP => Body::ProxyWillStop(ProxyWillStop {
            sublink: SublinkId(reader.u64()?),
            proxy_inbound_sequence_length: SequenceNumber::new(reader.u64()?),
        }),
        message_id::DECAY_UNBLOCKED => Body::DecayUnblocked(DecayUnblocked {
            sublink: SublinkId(reader.u64()?),
        }),
        message_id::LOG_ROUTE_TRACE => Body::LogRouteTrace(LogRouteTrace {
            sublink: SublinkId(reader.u64()?),
        }),
        message_id::ACCEPT_PARCEL => {
            let sublink = SublinkId(reader.u64()?);
            let sequence_number = SequenceNumber::new(reader.u64()?);
            let num_handles = reader.u32()?;
            let data_offset = reader.u32()? as usize;
            let data_len = reader.u32()? as usize;
            let descriptors_offset = reader.u32()? as usize;
            let descriptor_count = reader.u32()? as usize;

            let data_end = data_offset.checked_add(data_len).ok_or(
                WireError::MalformedBody {
                    reason: "data region overflow",
                },
            )?;
            if data_offset < HEADER_SIZE || data_end > data.len() {
                return Err(WireError::MalformedBody {
                    reason: "data region out of bounds",
                });
            }
            let descriptors_len = descriptor_count
                .checked_mul(DESCRIPTOR_WIRE_SIZE)
                .ok_or(WireError::MalformedBody {
                    reason: "descriptor region overflow",
                })?;
            let descriptors_end = descriptors_offset.checked_add(descriptors_len).ok_or(
                WireError::MalformedBody {
                    reason: "descriptor region overflow",
                },
            )?;
            if descriptors_offset < HEADER_SIZE || descriptors_end > data.len() {
                return Err(WireError::MalformedBody {
                    reason: "descriptor region out of bounds",
                });
            }

            let mut descriptors = Vec::with_capacity(descriptor_count);
            let mut descriptor_reader = Reader::new(&data[descriptors_offset..descriptors_end]);
            for _ in 0..descriptor_count {
                descriptors.push(read_descriptor(&mut descriptor_reader)?);
            }

            Body::AcceptParcel(AcceptParcel {
                sublink,
                sequence_number,
                data: data[data_offset..data_end].to_vec(),
                descriptors,
                num_handles,
            })
        }
        message_id::ADD_FRAGMENT_ALLOCATOR_BUFFER => {
            Body::AddFragmentAllocatorBuffer(AddFragmentAllocatorBuffer {
                buffer_id: BufferId(reader.u64()?),
                fragment_size: reader.u32()?,
            })
        }
        message_id::REQUEST_MEMORY => Body::RequestMemory(RequestMemory {
            size: reader.u32()?,
        }),
        message_id::PROVIDE_MEMORY => Body::ProvideMemory(ProvideMemory {
            size: reader.u32()?,
        }),
        message_id::SET_ROUTER_LINK_STATE_FRAGMENT => {
            Body::SetRouterLinkStateFragment(SetRouterLinkStateFragment {
                sublink: SublinkId(reader.u64()?),
                descriptor: reader.fragment()?,
            })
        }
        message_id::FLUSH_ROUTER => Body::FlushRouter(FlushRouter {
            sublink: SublinkId(reader.u64()?),
        }),
        message_id::FLUSH_LINK => Body::FlushLink(FlushLink {
            sublink: SublinkId(reader.u64()?),
        }),
        id => return Err(WireError::UnknownMessage { id }),
    };

    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: Body) -> (FrameHeader, Body) {
        let frame = encode_frame(42, &body).expect("encode");
        decode_frame(&frame).expect("decode")
    }

    #[test]
    fn test_header_fields() {
        let body = Body::FlushRouter(FlushRouter {
            sublink: SublinkId(3),
        });
        let frame = encode_frame(7, &body).expect("encode");
        let (header, _) = decode_frame(&frame).expect("decode");
        assert_eq!(header.size as usize, frame.len());
        assert_eq!(header.message_id, message_id::FLUSH_ROUTER);
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.transport_seq, 7);
    }

    #[test]
    fn test_connect_roundtrip() {
        let (_, body) = roundtrip(Body::Connect(Connect {
            name: NodeName::new(1, 2),
            protocol_version: 0,
            num_initial_portals: 3,
            has_primary_buffer: true,
        }));
        match body {
            Body::Connect(connect) => {
                assert_eq!(connect.name, NodeName::new(1, 2));
                assert_eq!(connect.num_initial_portals, 3);
                assert!(connect.has_primary_buffer);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_bypass_proxy_roundtrip() {
        let key = BypassKey::random();
        let (_, body) = roundtrip(Body::BypassProxy(BypassProxy {
            proxy_name: NodeName::new(5, 6),
            proxy_sublink: SublinkId(9),
            new_sublink: SublinkId(11),
            new_link_state: FragmentDescriptor {
                buffer: BufferId(2),
                offset: 640,
                size: 64,
            },
            bypass_key: key.to_bytes(),
            proxy_outbound_sequence_length: SequenceNumber::new(17),
        }));
        match body {
            Body::BypassProxy(bypass) => {
                assert_eq!(bypass.proxy_sublink, SublinkId(9));
                assert_eq!(bypass.new_link_state.offset, 640);
                assert_eq!(bypass.bypass_key, key.to_bytes());
                assert_eq!(
                    bypass.proxy_outbound_sequence_length,
                    SequenceNumber::new(17)
                );
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_accept_parcel_roundtrip() {
        let descriptor = RouterDescriptor {
            new_sublink: SublinkId(21),
            side: LinkSide::B,
            next_outgoing_sequence_number: SequenceNumber::new(4),
            next_incoming_sequence_number: SequenceNumber::new(6),
            peer_closed: true,
            closed_peer_sequence_length: SequenceNumber::new(6),
            proxy_peer_name: NodeName::new(8, 9),
            proxy_peer_sublink: SublinkId(13),
            bypass_key: Some(BypassKey::random()),
            ..RouterDescriptor::default()
        };
        let (_, body) = roundtrip(Body::AcceptParcel(AcceptParcel {
            sublink: SublinkId(1),
            sequence_number: SequenceNumber::new(33),
            data: b"payload".to_vec(),
            descriptors: vec![descriptor.clone()],
            num_handles: 2,
        }));
        match body {
            Body::AcceptParcel(accept) => {
                assert_eq!(accept.sequence_number, SequenceNumber::new(33));
                assert_eq!(accept.data, b"payload");
                assert_eq!(accept.num_handles, 2);
                assert_eq!(accept.descriptors.len(), 1);
                let decoded = &accept.descriptors[0];
                assert_eq!(decoded.new_sublink, descriptor.new_sublink);
                assert!(decoded.peer_closed);
                assert_eq!(decoded.proxy_peer_name, descriptor.proxy_peer_name);
                assert_eq!(decoded.bypass_key, descriptor.bypass_key);
                assert_eq!(decoded.side, LinkSide::B);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_accept_parcel_without_proxy_peer_flag_clears_name() {
        let descriptor = RouterDescriptor {
            new_sublink: SublinkId(21),
            ..RouterDescriptor::default()
        };
        let (_, body) = roundtrip(Body::AcceptParcel(AcceptParcel {
            sublink: SublinkId(1),
            sequence_number: SequenceNumber::ZERO,
            data: Vec::new(),
            descriptors: vec![descriptor],
            num_handles: 0,
        }));
        match body {
            Body::AcceptParcel(accept) => {
                assert!(!accept.descriptors[0].proxy_peer_name.is_valid());
                assert!(accept.descriptors[0].bypass_key.is_none());
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let body = Body::StopProxying(StopProxying {
            sublink: SublinkId(1),
            proxy_inbound_sequence_length: SequenceNumber::new(2),
            proxy_outbound_sequence_length: SequenceNumber::new(3),
        });
        let frame = encode_frame(0, &body).expect("encode");
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let body = Body::FlushLink(FlushLink {
            sublink: SublinkId(0),
        });
        let mut frame = encode_frame(0, &body).expect("encode");
        frame[2] = 200;
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::UnknownMessage { id: 200 })
        ));
    }

    #[test]
    fn test_region_bounds_validated() {
        let body = Body::AcceptParcel(AcceptParcel {
            sublink: SublinkId(1),
            sequence_number: SequenceNumber::ZERO,
            data: b"abc".to_vec(),
            descriptors: Vec::new(),
            num_handles: 0,
        });
        let mut frame = encode_frame(0, &body).expect("encode");
        // Corrupt the data length so the region runs off the frame.
        let len_pos = HEADER_SIZE + 8 + 8 + 4 + 4;
        frame[len_pos..len_pos + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::MalformedBody { .. })
        ));
    }
}
