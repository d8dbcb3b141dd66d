//! The application-facing handle for one end of a route.

use std::sync::Arc;

use bytes::Bytes;
use weft_core::DriverHandle;

use crate::parcel::Parcel;
use crate::router::Router;
use crate::status::{Limits, PortalStatus};
use crate::trap::{Trap, TrapConditions, TrapHandler};
use crate::PortalError;

/// One retrieved parcel: its bytes plus everything that was attached.
#[derive(Debug)]
pub struct Message {
    /// Payload bytes.
    pub data: Bytes,
    /// Portals that were attached to the parcel.
    pub portals: Vec<Portal>,
    /// Driver handles that were attached to the parcel.
    pub handles: Vec<DriverHandle>,
}

impl Message {
    fn from_parcel(mut parcel: Parcel) -> Message {
        Message {
            data: parcel.data_bytes(),
            portals: parcel.take_routers().into_iter().map(Portal::new).collect(),
            handles: parcel.take_handles(),
        }
    }
}

/// One end of a bidirectional byte-plus-capability channel.
///
/// Dropping a portal closes it; closure is idempotent and propagates to
/// the peer as soon as everything already sent has been transmitted.
#[derive(Debug)]
pub struct Portal {
    router: Option<Arc<Router>>,
}

impl Portal {
    pub(crate) fn new(router: Arc<Router>) -> Portal {
        Portal {
            router: Some(router),
        }
    }

    fn router(&self) -> &Arc<Router> {
        match &self.router {
            Some(router) => router,
            // The field is only vacated by consuming methods.
            None => unreachable!("portal used after close"),
        }
    }

    fn into_router(mut self) -> Arc<Router> {
        match self.router.take() {
            Some(router) => router,
            None => unreachable!("portal used after close"),
        }
    }

    /// Weak handle to the underlying router, for tests that observe
    /// retirement.
    pub fn downgrade(&self) -> std::sync::Weak<Router> {
        Arc::downgrade(self.router())
    }

    /// Current status: retrievable parcels and bytes, peer-closed and dead
    /// bits.
    pub fn query_status(&self) -> PortalStatus {
        self.router().query_status()
    }

    /// Sends `data` with attached portals and driver handles toward the
    /// peer.
    ///
    /// With `limits`, fails with [`PortalError::ResourceExhausted`] when
    /// the receiving queue would exceed them. Fails with
    /// [`PortalError::NotFound`] once the peer is closed.
    ///
    /// Attachments are consumed unconditionally; on failure they are
    /// closed rather than returned.
    pub fn put(
        &self,
        data: &[u8],
        portals: Vec<Portal>,
        handles: Vec<DriverHandle>,
        limits: Option<&Limits>,
    ) -> Result<(), PortalError> {
        let routers = self.validate_attachments(portals)?;
        let parcel = Parcel::with_attachments(Bytes::copy_from_slice(data), routers, handles);
        self.router().send(parcel, limits)
    }

    fn validate_attachments(&self, portals: Vec<Portal>) -> Result<Vec<Arc<Router>>, PortalError> {
        for attached in &portals {
            let attached_router = attached.router();
            if Arc::ptr_eq(attached_router, self.router()) {
                return Err(PortalError::InvalidArgument {
                    reason: "cannot send a portal through itself",
                });
            }
            if self.router().has_local_peer(attached_router) {
                return Err(PortalError::InvalidArgument {
                    reason: "cannot send a portal through its own peer",
                });
            }
        }
        Ok(portals.into_iter().map(Portal::into_router).collect())
    }

    /// Retrieves the next parcel, in sequence order.
    ///
    /// Fails with [`PortalError::Unavailable`] when nothing is queued yet
    /// and [`PortalError::NotFound`] once the route is closed and drained.
    pub fn get(&self) -> Result<Message, PortalError> {
        let parcel = self.router().get_next_parcel()?;
        Ok(Message::from_parcel(parcel))
    }

    /// Begins a two-phase put by reserving a writable span of `num_bytes`.
    pub fn begin_put(&self, num_bytes: usize) -> Result<PendingPut<'_>, PortalError> {
        self.router().begin_put(num_bytes)?;
        Ok(PendingPut {
            portal: self,
            consumed: false,
        })
    }

    /// Begins a two-phase get over the next parcel.
    pub fn begin_get(&self) -> Result<PendingGet<'_>, PortalError> {
        let (data, num_portals, num_handles) = self.router().begin_get()?;
        Ok(PendingGet {
            portal: self,
            data,
            num_portals,
            num_handles,
            consumed: false,
        })
    }

    /// Bridges this portal's route with `other`'s. Both portals must be
    /// unused; both are consumed, and their routes behave as one from here
    /// on.
    pub fn merge(self, other: Portal) -> Result<(), PortalError> {
        let own = self.into_router();
        let theirs = other.into_router();
        own.merge_route(&theirs)
    }

    /// Creates a trap watching this portal for `conditions`.
    pub fn create_trap(&self, conditions: TrapConditions, handler: TrapHandler) -> Arc<Trap> {
        self.router().create_trap(conditions, handler)
    }

    /// Arms `trap`. Fails with [`PortalError::FailedPrecondition`] when a
    /// watched condition already holds or the trap is already armed.
    pub fn arm_trap(&self, trap: &Arc<Trap>) -> Result<(), PortalError> {
        self.router().arm_trap(trap)
    }

    /// Destroys `trap`. With `blocking`, waits until any in-flight handler
    /// invocation has returned; afterwards the handler can never run
    /// again.
    pub fn destroy_trap(&self, trap: &Arc<Trap>, blocking: bool) {
        self.router().destroy_trap(trap, blocking);
    }

    /// Closes this portal now instead of at drop.
    pub fn close(mut self) {
        if let Some(router) = self.router.take() {
            router.close_route();
        }
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if let Some(router) = self.router.take() {
            router.close_route();
        }
    }
}

/// An in-progress two-phase put. Dropping it without committing aborts
/// the put, releasing the reserved span with no observable effect.
pub struct PendingPut<'a> {
    portal: &'a Portal,
    consumed: bool,
}

impl PendingPut<'_> {
    /// Runs `f` over the reserved span.
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PortalError> {
        self.portal.router().with_put_span(f)
    }

    /// Publishes the first `num_bytes_produced` bytes of the span, with
    /// attachments, at the next outbound sequence number.
    pub fn commit_put(
        mut self,
        num_bytes_produced: usize,
        portals: Vec<Portal>,
        handles: Vec<DriverHandle>,
    ) -> Result<(), PortalError> {
        let routers = self.portal.validate_attachments(portals)?;
        self.consumed = true;
        self.portal
            .router()
            .commit_put(num_bytes_produced, routers, handles)
    }

    /// Releases the span without sending anything.
    pub fn abort_put(mut self) {
        self.consumed = true;
        let _ = self.portal.router().abort_put();
    }
}

impl Drop for PendingPut<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            let _ = self.portal.router().abort_put();
        }
    }
}

/// An in-progress two-phase get. Dropping it without committing aborts
/// the get, leaving observable state untouched.
pub struct PendingGet<'a> {
    portal: &'a Portal,
    data: Bytes,
    num_portals: usize,
    num_handles: usize,
    consumed: bool,
}

impl PendingGet<'_> {
    /// The parcel's unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of portals attached to the parcel.
    pub fn num_portals(&self) -> usize {
        self.num_portals
    }

    /// Number of driver handles attached to the parcel.
    pub fn num_handles(&self) -> usize {
        self.num_handles
    }

    /// Consumes `num_bytes` of the parcel. When that exhausts the data,
    /// the parcel is popped and returned with its attachments.
    pub fn commit_get(mut self, num_bytes: usize) -> Result<Option<Message>, PortalError> {
        self.consumed = true;
        let popped = self.portal.router().commit_get(num_bytes)?;
        Ok(popped.map(Message::from_parcel))
    }

    /// Abandons the get; a later get observes the same parcel.
    pub fn abort_get(mut self) {
        self.consumed = true;
        let _ = self.portal.router().abort_get();
    }
}

impl Drop for PendingGet<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            let _ = self.portal.router().abort_get();
        }
    }
}
