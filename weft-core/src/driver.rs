//! The driver abstraction injected into the routing engine.
//!
//! The engine never talks to the operating system directly. Everything
//! platform-specific (transport endpoints, shared memory, handle
//! duplication) is supplied by a [`Driver`] implementation. The engine
//! calls the driver; the driver calls back into the engine on its own
//! threads through an [`ActivityHandler`].
//!
//! Transports are unordered, unreliable-about-nothing byte+handle pipes:
//! every frame handed to [`Transport::transmit`] arrives intact exactly once
//! at the peer (or the transport errors out), but frames may be delivered in
//! any order. The engine layers its own sequencing on top.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Errors surfaced by driver operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The transport is not in a state that allows the operation.
    #[error("transport is inactive")]
    TransportInactive,

    /// The peer endpoint is gone and the frame could not be delivered.
    #[error("transport disconnected")]
    Disconnected,

    /// Shared memory could not be allocated or mapped.
    #[error("shared memory failure: {reason}")]
    Memory {
        /// Driver-specific detail.
        reason: &'static str,
    },
}

/// Callbacks a transport invokes, on driver-owned threads, as activity
/// occurs.
pub trait ActivityHandler: Send + Sync {
    /// A complete frame arrived from the peer endpoint.
    fn on_message(&self, data: &[u8], handles: Vec<DriverHandle>);

    /// The transport failed; no further frames will be delivered.
    fn on_error(&self);
}

/// One endpoint of a duplex frame transport.
pub trait Transport: Send + Sync {
    /// Activates the endpoint, directing all subsequent activity at
    /// `handler`. Frames received before activation are buffered and
    /// delivered upon activation, in receipt order.
    ///
    /// Activating an endpoint that already has a handler replaces the
    /// handler; the engine uses this to hand a connection off from its
    /// greeting logic to a fully constructed link.
    fn activate(&self, handler: Arc<dyn ActivityHandler>) -> Result<(), DriverError>;

    /// Permanently deactivates the endpoint. Buffered and future frames are
    /// dropped and the handler reference is released.
    fn deactivate(&self);

    /// Transmits one frame with an out-of-band array of handles.
    fn transmit(&self, data: &[u8], handles: Vec<DriverHandle>) -> Result<(), DriverError>;
}

/// A driver-owned shared memory object, not yet mapped.
///
/// Cloning the handle duplicates it; all duplicates refer to the same
/// underlying memory.
pub trait MemoryRegion: Send + Sync {
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// Whether the region is zero-sized. Always false for driver-allocated
    /// regions.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps the region into this process.
    fn map(self: Arc<Self>) -> Result<Mapping, DriverError>;
}

/// A shared memory region duplicable across transports.
pub type SharedRegion = Arc<dyn MemoryRegion>;

/// A live mapping of a [`MemoryRegion`].
///
/// The mapped bytes are shared with other nodes concurrently; safe access
/// is the caller's responsibility and in practice means atomics, or plain
/// data guarded by an in-memory lock protocol.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
    // Keeps the backing allocation alive for the mapping's lifetime.
    _owner: Arc<dyn Any + Send + Sync>,
}

// The raw base pointer refers to driver-managed shared memory whose
// concurrent use is governed by the protocols layered on top of it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Builds a mapping over `len` bytes at `base`, holding `owner` alive.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `len` bytes that remain valid and
    /// writable for as long as `owner` is alive.
    pub unsafe fn new(base: NonNull<u8>, len: usize, owner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            base,
            len,
            _owner: owner,
        }
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the byte at `offset`, or `None` when out of bounds.
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.len {
            return None;
        }
        // Bounds were checked against the mapping length just above.
        NonNull::new(unsafe { self.base.as_ptr().add(offset) })
    }

    /// Raw base pointer of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

/// An opaque driver-defined object attachable to a parcel.
pub trait DriverObject: Send + fmt::Debug {}

/// One out-of-band attachment travelling alongside a transport frame.
///
/// Handles are never part of the framed byte payload; the driver moves them
/// in a parallel array and is responsible for any cross-process duplication.
pub enum DriverHandle {
    /// A transport endpoint, e.g. one half of a freshly created pair being
    /// introduced to another node.
    Transport(Arc<dyn Transport>),
    /// A shared memory object.
    Memory(SharedRegion),
    /// An arbitrary driver object attached by the application.
    Object(Box<dyn DriverObject>),
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverHandle::Transport(_) => write!(f, "DriverHandle::Transport"),
            DriverHandle::Memory(region) => {
                write!(f, "DriverHandle::Memory({} bytes)", region.len())
            }
            DriverHandle::Object(object) => write!(f, "DriverHandle::Object({object:?})"),
        }
    }
}

/// The full set of platform services injected into a node.
pub trait Driver: Send + Sync {
    /// Creates a connected pair of transport endpoints.
    fn create_transports(
        &self,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), DriverError>;

    /// Allocates a shared memory region of at least `len` bytes.
    fn allocate_shared_memory(&self, len: usize) -> Result<SharedRegion, DriverError>;
}
