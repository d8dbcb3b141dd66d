//! The unit of delivery between two portals.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use weft_core::{DriverHandle, SequenceNumber};

use crate::router::Router;
use crate::sequenced_queue::QueueItem;

/// One delivered unit: bytes plus attached portals plus attached driver
/// handles, stamped with its position in the sending direction's sequence.
///
/// Attached portals are carried as their routers. A parcel owns its
/// attachments: dropping a parcel that still holds routers closes each of
/// them, so nothing leaks when a route is torn down with traffic in flight.
pub struct Parcel {
    sequence_number: SequenceNumber,
    data: Bytes,
    routers: Vec<Arc<Router>>,
    handles: Vec<DriverHandle>,
}

impl Parcel {
    /// An empty parcel; the sequence number is assigned at transmission.
    pub fn new(data: Bytes) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            routers: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// A parcel with attachments.
    pub fn with_attachments(
        data: Bytes,
        routers: Vec<Arc<Router>>,
        handles: Vec<DriverHandle>,
    ) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            routers,
            handles,
        }
    }

    /// This parcel's position in its direction's sequence.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Stamps the sequence number. Done once, when the sending router
    /// reserves the next outbound number.
    pub fn set_sequence_number(&mut self, n: SequenceNumber) {
        self.sequence_number = n;
    }

    /// The unconsumed payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// A cheap owned view of the unconsumed payload.
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Unconsumed payload length.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Advances past `n` consumed bytes without copying.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.data.advance(n.min(self.data.len()));
    }

    /// Routers attached to this parcel.
    pub fn routers(&self) -> &[Arc<Router>] {
        &self.routers
    }

    /// Number of attached routers.
    pub fn num_routers(&self) -> usize {
        self.routers.len()
    }

    /// Number of attached driver handles.
    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }

    /// Takes ownership of the attached routers, leaving none behind.
    pub fn take_routers(&mut self) -> Vec<Arc<Router>> {
        std::mem::take(&mut self.routers)
    }

    /// Takes ownership of the attached driver handles.
    pub fn take_handles(&mut self) -> Vec<DriverHandle> {
        std::mem::take(&mut self.handles)
    }

    /// Log-friendly one-line description.
    pub fn describe(&self) -> String {
        format!(
            "parcel {} ({} bytes, {} portals, {} handles)",
            self.sequence_number,
            self.data.len(),
            self.routers.len(),
            self.handles.len()
        )
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        // An undelivered parcel closes whatever it was carrying.
        for router in self.routers.drain(..) {
            router.close_route();
        }
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("sequence_number", &self.sequence_number)
            .field("data_len", &self.data.len())
            .field("num_routers", &self.routers.len())
            .field("num_handles", &self.handles.len())
            .finish()
    }
}

impl QueueItem for Parcel {
    fn size_in_queue(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_advances_without_copy() {
        let mut parcel = Parcel::new(Bytes::from_static(b"hello world"));
        parcel.consume(6);
        assert_eq!(parcel.data(), b"world");
        assert_eq!(parcel.size_in_queue(), 5);
    }

    #[test]
    fn test_sequence_number_stamping() {
        let mut parcel = Parcel::new(Bytes::new());
        parcel.set_sequence_number(SequenceNumber::new(9));
        assert_eq!(parcel.sequence_number(), SequenceNumber::new(9));
    }
}
