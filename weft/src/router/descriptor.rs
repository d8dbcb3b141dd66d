//! Serialized form of a router crossing a node boundary.

use weft_core::{LinkSide, NodeName, SequenceNumber, SublinkId};

use crate::link::state::BypassKey;
use crate::node::memory::FragmentDescriptor;

/// Everything a receiving node needs to construct a router extending an
/// existing route, wired to the sender over a freshly allocated sublink.
///
/// Descriptors ride inside parcels, one per attached portal.
#[derive(Debug, Clone)]
pub struct RouterDescriptor {
    /// Sublink binding the new router to its sender-side counterpart.
    pub new_sublink: SublinkId,
    /// Second sublink carrying parcels already queued at the sender when
    /// the local-peer fast path applies. Meaningful only when
    /// `proxy_already_bypassed` is set.
    pub new_decaying_sublink: SublinkId,
    /// Shared link state for the new central link, when the fast path
    /// applies.
    pub new_link_state: FragmentDescriptor,
    /// Which side of the route the new router is.
    pub side: LinkSide,
    /// Next sequence number the new router will send.
    pub next_outgoing_sequence_number: SequenceNumber,
    /// Next sequence number the new router expects to receive.
    pub next_incoming_sequence_number: SequenceNumber,
    /// Inbound sequence length still owed through the decaying sublink on
    /// the fast path.
    pub decaying_incoming_sequence_length: SequenceNumber,
    /// The peer endpoint had already closed when the router moved.
    pub peer_closed: bool,
    /// Final inbound sequence length when `peer_closed` is set.
    pub closed_peer_sequence_length: SequenceNumber,
    /// The sender's old local peer was linked directly; the new router's
    /// primary link is already the route's central link.
    pub proxy_already_bypassed: bool,
    /// Node hosting the sender's outward peer, when the sender has locked
    /// itself in for immediate bypass. Invalid otherwise.
    pub proxy_peer_name: NodeName,
    /// Sublink identifying the sender's link to that outward peer.
    pub proxy_peer_sublink: SublinkId,
    /// Credential the new router must present to the outward peer to
    /// complete the bypass.
    pub bypass_key: Option<BypassKey>,
}

impl Default for RouterDescriptor {
    fn default() -> Self {
        Self {
            new_sublink: SublinkId(0),
            new_decaying_sublink: SublinkId(0),
            new_link_state: FragmentDescriptor::NULL,
            side: LinkSide::B,
            next_outgoing_sequence_number: SequenceNumber::ZERO,
            next_incoming_sequence_number: SequenceNumber::ZERO,
            decaying_incoming_sequence_length: SequenceNumber::ZERO,
            peer_closed: false,
            closed_peer_sequence_length: SequenceNumber::ZERO,
            proxy_already_bypassed: false,
            proxy_peer_name: NodeName::default(),
            proxy_peer_sublink: SublinkId(0),
            bypass_key: None,
        }
    }
}
