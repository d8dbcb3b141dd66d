//! # Weft
//!
//! An inter-process message-passing fabric built around **portals**:
//! bidirectional byte-plus-capability channels whose ends may live on any
//! node in a mesh and may themselves be sent through other portals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                   │
//! │        Portal: put/get, traps, merge            │
//! ├─────────────────────────────────────────────────┤
//! │     Router (per-endpoint state machine)         │
//! │     • FIFO via sequence-numbered queues         │
//! │     • Proxy insertion and eager bypass          │
//! ├─────────────────────────────────────────────────┤
//! │     NodeLink (per-peer connection)              │
//! │     • Sublink multiplexing                      │
//! │     • Shared-memory pool + link state           │
//! ├─────────────────────────────────────────────────┤
//! │     Driver (injected platform services)         │
//! │     • Unordered frame transports                │
//! │     • Shared memory allocation                  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! When a portal is transferred to another node, its old router stays
//! behind as a proxy. The bypass protocol then collapses the proxy chain:
//! routers negotiate through shared-memory link state, install a direct
//! link between the surviving endpoints, and retire the proxy once every
//! in-flight parcel has drained, without ever losing, duplicating, or
//! reordering a parcel. Sequence numbers are assigned once per direction
//! and survive any amount of rerouting, so a receiver's queue merges old-
//! and new-path deliveries transparently.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use weft::{Node, NodeConfig, NodeType};
//! use weft_core::SingleProcessDriver;
//!
//! let driver = Arc::new(SingleProcessDriver);
//! let node = Node::create(driver, NodeType::Broker, NodeConfig::default());
//! let (a, b) = node.open_portals();
//!
//! a.put(b"hello", Vec::new(), Vec::new(), None).expect("put");
//! let message = b.get().expect("get");
//! assert_eq!(&message.data[..], b"hello");
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Error types surfaced by portal operations.
pub mod error;

/// Links between neighboring routers.
pub mod link;

/// Nodes, node links, and shared memory pooling.
pub mod node;

/// The unit of delivery.
pub mod parcel;

/// The application-facing portal surface.
pub mod portal;

/// The per-endpoint routing state machine.
pub mod router;

/// Sequence-ordered sparse queues.
pub mod sequenced_queue;

/// Portal status and advisory limits.
pub mod status;

/// Edge-triggered status traps.
pub mod trap;

/// Wire protocol for node link frames.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::PortalError;
pub use link::state::{BypassKey, RouterLinkState};
pub use node::memory::{FragmentDescriptor, FragmentRef, NodeLinkMemory};
pub use node::{Node, NodeConfig, NodeType};
pub use parcel::Parcel;
pub use portal::{Message, PendingGet, PendingPut, Portal};
pub use router::{Router, RoutingMode};
pub use sequenced_queue::{QueueItem, SequencedQueue, MAX_SEQUENCE_GAP};
pub use status::{status_flags, Limits, PortalStatus};
pub use trap::{trap_conditions, Trap, TrapConditions, TrapEvent, TrapHandler};

// Driver-facing types, re-exported so applications need only one import.
pub use weft_core::{
    ActivityHandler, Driver, DriverError, DriverHandle, LinkSide, NodeName, SequenceNumber,
    SharedRegion, SingleProcessDriver, SublinkId, Transport,
};
