//! One side of a router: its links and their decay bookkeeping.

use std::sync::Arc;

use weft_core::{NodeName, SequenceNumber, SublinkId};

use crate::link::state::BypassKey;
use crate::link::RouterLink;
use crate::node::link::NodeLink;
use crate::parcel::Parcel;
use crate::router::Router;
use crate::sequenced_queue::SequencedQueue;

/// Parcel and control traffic on one facing (inward, outward, or bridge)
/// of a router.
///
/// An edge has at most two links at a time: a primary link carrying new
/// traffic and a decaying link restricted to a bounded range of sequence
/// numbers. When the decaying link has carried everything in its range it
/// is dropped, and the edge becomes stable again. Stability is what makes the
/// next link replacement (and therefore route shortening) possible.
pub(crate) struct RouteEdge {
    primary: Option<Arc<dyn RouterLink>>,
    decaying: Option<Arc<dyn RouterLink>>,
    /// Decay was requested before any primary link existed; the next
    /// primary installed starts decaying immediately.
    decay_deferred: bool,
    length_to_decaying: Option<SequenceNumber>,
    length_from_decaying: Option<SequenceNumber>,
}

impl RouteEdge {
    pub fn new() -> Self {
        Self {
            primary: None,
            decaying: None,
            decay_deferred: false,
            length_to_decaying: None,
            length_from_decaying: None,
        }
    }

    pub fn primary(&self) -> Option<&Arc<dyn RouterLink>> {
        self.primary.as_ref()
    }

    pub fn decaying(&self) -> Option<&Arc<dyn RouterLink>> {
        self.decaying.as_ref()
    }

    /// Stable: a primary link and nothing decaying.
    pub fn is_stable(&self) -> bool {
        self.primary.is_some() && self.decaying.is_none() && !self.decay_deferred
    }

    /// Winding down: decaying with no replacement primary expected.
    pub fn is_decaying(&self) -> bool {
        (self.decaying.is_some() || self.decay_deferred) && self.primary.is_none()
    }

    pub fn length_from_decaying(&self) -> Option<SequenceNumber> {
        self.length_from_decaying
    }

    pub fn set_length_to_decaying(&mut self, length: SequenceNumber) {
        debug_assert!(!self.is_stable());
        debug_assert!(self.length_to_decaying.is_none());
        self.length_to_decaying = Some(length);
    }

    pub fn set_length_from_decaying(&mut self, length: SequenceNumber) {
        debug_assert!(!self.is_stable());
        debug_assert!(self.length_from_decaying.is_none());
        self.length_from_decaying = Some(length);
    }

    pub fn set_lengths(&mut self, to: SequenceNumber, from: SequenceNumber) {
        self.set_length_to_decaying(to);
        self.set_length_from_decaying(from);
    }

    /// The local router behind the primary link, if any.
    pub fn local_peer(&self) -> Option<Arc<Router>> {
        self.primary.as_ref()?.local_target()
    }

    /// The local router behind the decaying link, if any.
    pub fn decaying_local_peer(&self) -> Option<Arc<Router>> {
        self.decaying.as_ref()?.local_target()
    }

    /// Installs a primary link, or, when decay was deferred, the link
    /// that immediately starts decaying.
    pub fn set_primary_link(&mut self, link: Arc<dyn RouterLink>) {
        if self.decay_deferred {
            debug_assert!(self.decaying.is_none());
            self.decay_deferred = false;
            self.decaying = Some(link);
        } else {
            debug_assert!(self.primary.is_none());
            self.primary = Some(link);
        }
    }

    pub fn release_primary_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.primary.take()
    }

    pub fn release_decaying_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.decaying.take()
    }

    /// Whether either link runs over `sublink` of `node_link`.
    pub fn is_routed_through(&self, node_link: &Arc<NodeLink>, sublink: SublinkId) -> bool {
        let check = |link: &Option<Arc<dyn RouterLink>>| {
            link.as_ref()
                .is_some_and(|link| link.is_remote_link_to(node_link, sublink))
        };
        check(&self.primary) || check(&self.decaying)
    }

    /// The link parcel `n` should be transmitted on right now, if any:
    /// the decaying link while `n` falls in its range, the primary link
    /// otherwise.
    pub fn link_for_transmission(&self, n: SequenceNumber) -> Option<Arc<dyn RouterLink>> {
        if self.should_send_on_decaying(n) {
            self.decaying.clone()
        } else {
            self.primary.clone()
        }
    }

    /// Moves transmittable parcels off `queue`: sequence numbers within
    /// the decaying link's range go to `to_decaying`, later ones to
    /// `to_primary`, stopping at the first parcel whose target link is
    /// missing.
    pub fn flush_parcels(
        &self,
        queue: &mut SequencedQueue<Parcel>,
        to_decaying: &mut Vec<Parcel>,
        to_primary: &mut Vec<Parcel>,
    ) {
        while queue.has_next() {
            let n = queue.current_sequence_number();
            if self.should_send_on_decaying(n) {
                if self.decaying.is_some() {
                    if let Some(parcel) = queue.pop() {
                        to_decaying.push(parcel);
                    }
                } else {
                    break;
                }
            } else if self.primary.is_some() {
                if let Some(parcel) = queue.pop() {
                    to_primary.push(parcel);
                }
            } else {
                break;
            }
        }
    }

    /// Locks the primary link so this side can coordinate its own bypass.
    pub fn try_lock_primary_for_bypass(
        &self,
        source: NodeName,
        key: Option<BypassKey>,
    ) -> bool {
        self.is_stable()
            && self
                .primary
                .as_ref()
                .is_some_and(|link| link.try_lock_for_bypass(source, key))
    }

    /// Whether a bypass request from `source` is authorized against the
    /// primary link's shared state.
    pub fn can_node_request_bypass(&self, source: NodeName, key: Option<&BypassKey>) -> bool {
        self.primary
            .as_ref()
            .is_some_and(|link| link.can_node_request_bypass(source, key))
    }

    /// Begins decaying the primary link (or defers the decay to the next
    /// primary). Fails if something is already decaying here.
    pub fn start_decaying(
        &mut self,
        length_to: Option<SequenceNumber>,
        length_from: Option<SequenceNumber>,
    ) -> bool {
        if self.decaying.is_some() || self.decay_deferred {
            return false;
        }
        debug_assert!(self.length_to_decaying.is_none());
        debug_assert!(self.length_from_decaying.is_none());
        self.length_to_decaying = length_to;
        self.length_from_decaying = length_from;
        match self.primary.take() {
            Some(primary) => self.decaying = Some(primary),
            None => self.decay_deferred = true,
        }
        true
    }

    /// Completes the decay if both length limits are known and met,
    /// clearing the decaying link and its bookkeeping.
    pub fn try_finish_decay(
        &mut self,
        sequence_length_sent: SequenceNumber,
        sequence_length_received: SequenceNumber,
    ) -> bool {
        if self.decaying.is_none() {
            return false;
        }
        let (Some(to), Some(from)) = (self.length_to_decaying, self.length_from_decaying)
        else {
            return false;
        };
        if sequence_length_sent < to || sequence_length_received < from {
            return false;
        }
        self.decaying = None;
        self.length_to_decaying = None;
        self.length_from_decaying = None;
        true
    }

    fn should_send_on_decaying(&self, n: SequenceNumber) -> bool {
        if self.decaying.is_none() && !self.decay_deferred {
            return false;
        }
        match self.length_to_decaying {
            Some(limit) => n < limit,
            // Range not pinned yet; everything still belongs to the old
            // link.
            None => true,
        }
    }

    pub fn describe(&self) -> String {
        let primary = self
            .primary
            .as_ref()
            .map_or_else(|| "none".to_string(), |link| link.describe());
        let decaying = self
            .decaying
            .as_ref()
            .map_or_else(|| "none".to_string(), |link| link.describe());
        format!(
            "primary: {primary}; decaying: {decaying} (to {:?}, from {:?})",
            self.length_to_decaying, self.length_from_decaying
        )
    }
}
