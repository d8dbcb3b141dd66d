//! # Weft Core
//!
//! Foundational types for the weft portal fabric: sequence numbers, node
//! and sublink addressing, link side labels, and the [`Driver`] abstraction
//! through which the routing engine reaches transports and shared memory.
//!
//! The routing engine itself lives in the `weft` crate; this crate is the
//! stable substrate both the engine and driver implementations depend on.
//! A [`SingleProcessDriver`] is included for tests and examples.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// The injected platform abstraction: transports, shared memory, handles.
pub mod driver;

/// Node, sublink, and buffer identifiers.
pub mod ids;

/// Side labels for symmetric links.
pub mod link_side;

/// Monotonic per-direction sequence numbering.
pub mod sequence;

/// In-process reference driver.
pub mod single_process;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use driver::{
    ActivityHandler, Driver, DriverError, DriverHandle, DriverObject, Mapping, MemoryRegion,
    SharedRegion, Transport,
};
pub use ids::{BufferId, NodeName, SublinkId};
pub use link_side::LinkSide;
pub use sequence::SequenceNumber;
pub use single_process::SingleProcessDriver;
