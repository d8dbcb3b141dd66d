//! An in-process reference driver.
//!
//! Transport "endpoints" are paired in-memory queues and shared memory is a
//! heap allocation mapped at the same address by every node. This driver
//! backs the integration tests and examples; it exercises the full engine,
//! including the shared-memory protocols, without any OS dependencies.
//!
//! Delivery is synchronous: a transmitted frame is handed to the peer's
//! activity handler on the transmitting thread, which makes multi-node
//! tests deterministic. Frames transmitted before the peer activates are
//! buffered and flushed on activation.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{
    ActivityHandler, Driver, DriverError, DriverHandle, Mapping, MemoryRegion, SharedRegion,
    Transport,
};

/// Driver implementation connecting nodes within one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessDriver;

struct EndpointState {
    handler: Option<Arc<dyn ActivityHandler>>,
    pending: VecDeque<(Vec<u8>, Vec<DriverHandle>)>,
    closed: bool,
}

struct Endpoint {
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EndpointState {
                handler: None,
                pending: VecDeque::new(),
                closed: false,
            }),
        })
    }
}

/// One half of an in-process transport pair.
struct InProcessTransport {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl Transport for InProcessTransport {
    fn activate(&self, handler: Arc<dyn ActivityHandler>) -> Result<(), DriverError> {
        let backlog = {
            let mut state = self.local.state.lock();
            if state.closed {
                return Err(DriverError::TransportInactive);
            }
            state.handler = Some(handler.clone());
            std::mem::take(&mut state.pending)
        };

        for (data, handles) in backlog {
            handler.on_message(&data, handles);
        }
        Ok(())
    }

    fn deactivate(&self) {
        {
            let mut state = self.local.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.handler = None;
            state.pending.clear();
        }
        // A closed endpoint is a broken pipe from the peer's perspective.
        let peer_handler = {
            let state = self.peer.state.lock();
            if state.closed {
                None
            } else {
                state.handler.clone()
            }
        };
        if let Some(handler) = peer_handler {
            handler.on_error();
        }
    }

    fn transmit(&self, data: &[u8], handles: Vec<DriverHandle>) -> Result<(), DriverError> {
        let handler = {
            let mut state = self.peer.state.lock();
            if state.closed {
                return Err(DriverError::Disconnected);
            }
            match &state.handler {
                Some(handler) => handler.clone(),
                None => {
                    state.pending.push_back((data.to_vec(), handles));
                    return Ok(());
                }
            }
        };

        // Delivered outside the endpoint lock so the receiver may transmit
        // a reply on this same thread.
        handler.on_message(data, handles);
        Ok(())
    }
}

/// Heap-backed shared memory. Every mapping aliases the same bytes.
struct HeapRegion {
    data: Box<[UnsafeCell<u8>]>,
}

// Concurrent access to the region is governed by the atomics and lock
// protocols the engine lays out inside it.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl MemoryRegion for HeapRegion {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn map(self: Arc<Self>) -> Result<Mapping, DriverError> {
        let base = NonNull::new(self.data.as_ptr() as *const u8 as *mut u8)
            .ok_or(DriverError::Memory {
                reason: "zero-sized region",
            })?;
        let len = self.data.len();
        let owner: Arc<dyn std::any::Any + Send + Sync> = self;
        // The allocation lives as long as `owner`, which the mapping holds.
        Ok(unsafe { Mapping::new(base, len, owner) })
    }
}

impl Driver for SingleProcessDriver {
    fn create_transports(
        &self,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), DriverError> {
        let a = Endpoint::new();
        let b = Endpoint::new();
        let first = Arc::new(InProcessTransport {
            local: a.clone(),
            peer: b.clone(),
        });
        let second = Arc::new(InProcessTransport { local: b, peer: a });
        Ok((first, second))
    }

    fn allocate_shared_memory(&self, len: usize) -> Result<SharedRegion, DriverError> {
        if len == 0 {
            return Err(DriverError::Memory {
                reason: "zero-sized allocation",
            });
        }
        let data: Box<[UnsafeCell<u8>]> = (0..len).map(|_| UnsafeCell::new(0)).collect();
        Ok(Arc::new(HeapRegion { data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ActivityHandler for Recorder {
        fn on_message(&self, data: &[u8], _handles: Vec<DriverHandle>) {
            self.frames.lock().push(data.to_vec());
        }

        fn on_error(&self) {}
    }

    #[test]
    fn test_transmit_after_activation_delivers_inline() {
        let driver = SingleProcessDriver;
        let (a, b) = driver.create_transports().expect("transports");
        let recorder = Arc::new(Recorder {
            frames: Mutex::new(Vec::new()),
        });
        b.activate(recorder.clone()).expect("activate");

        a.transmit(b"hello", Vec::new()).expect("transmit");
        assert_eq!(recorder.frames.lock().as_slice(), &[b"hello".to_vec()]);
    }

    #[test]
    fn test_frames_buffered_until_activation() {
        let driver = SingleProcessDriver;
        let (a, b) = driver.create_transports().expect("transports");

        a.transmit(b"one", Vec::new()).expect("transmit");
        a.transmit(b"two", Vec::new()).expect("transmit");

        let recorder = Arc::new(Recorder {
            frames: Mutex::new(Vec::new()),
        });
        b.activate(recorder.clone()).expect("activate");
        assert_eq!(
            recorder.frames.lock().as_slice(),
            &[b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_transmit_to_deactivated_peer_fails() {
        let driver = SingleProcessDriver;
        let (a, b) = driver.create_transports().expect("transports");
        b.deactivate();
        assert!(matches!(
            a.transmit(b"x", Vec::new()),
            Err(DriverError::Disconnected)
        ));
    }

    #[test]
    fn test_shared_memory_is_shared_between_mappings() {
        let driver = SingleProcessDriver;
        let region = driver.allocate_shared_memory(64).expect("alloc");
        let first = region.clone().map().expect("map");
        let second = region.map().expect("map");

        let ptr = first.ptr_at(7).expect("in bounds");
        unsafe { ptr.as_ptr().write(42) };
        let other = second.ptr_at(7).expect("in bounds");
        assert_eq!(unsafe { other.as_ptr().read() }, 42);
    }

    #[test]
    fn test_mapping_bounds() {
        let driver = SingleProcessDriver;
        let region = driver.allocate_shared_memory(16).expect("alloc");
        let mapping = region.map().expect("map");
        assert_eq!(mapping.len(), 16);
        assert!(mapping.ptr_at(15).is_some());
        assert!(mapping.ptr_at(16).is_none());
    }
}
