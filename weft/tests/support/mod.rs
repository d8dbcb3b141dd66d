//! Shared fixtures for the end-to-end suite.

use std::sync::Arc;

use parking_lot::Mutex;
use weft::{
    Driver, DriverError, DriverHandle, Node, NodeConfig, NodeType, Portal, SharedRegion,
    SingleProcessDriver, Transport,
};

/// A standalone node on its own in-process driver.
pub fn new_node(node_type: NodeType) -> Arc<Node> {
    Node::create(Arc::new(SingleProcessDriver), node_type, NodeConfig::default())
}

/// Connects two nodes over a fresh transport pair with `n` initial
/// portals, returning each side's portals.
pub fn connect_pair(
    driver: &Arc<SingleProcessDriver>,
    first: &Arc<Node>,
    second: &Arc<Node>,
    n: usize,
) -> (Vec<Portal>, Vec<Portal>) {
    let (t1, t2) = driver.create_transports().expect("transports");
    let first_portals = first.connect_node(t1, n).expect("connect first");
    let second_portals = second.connect_node(t2, n).expect("connect second");
    (first_portals, second_portals)
}

struct ReorderState {
    passed_first: bool,
    held: Option<(Vec<u8>, Vec<DriverHandle>)>,
}

/// A transport that swaps every adjacent pair of frames after the first,
/// simulating an unordered driver.
pub struct ReorderingTransport {
    inner: Arc<dyn Transport>,
    state: Mutex<ReorderState>,
}

impl ReorderingTransport {
    fn wrap(inner: Arc<dyn Transport>) -> Arc<ReorderingTransport> {
        Arc::new(ReorderingTransport {
            inner,
            state: Mutex::new(ReorderState {
                passed_first: false,
                held: None,
            }),
        })
    }

    fn flush(&self) {
        let held = self.state.lock().held.take();
        if let Some((data, handles)) = held {
            let _ = self.inner.transmit(&data, handles);
        }
    }
}

impl Transport for ReorderingTransport {
    fn activate(
        &self,
        handler: Arc<dyn weft::ActivityHandler>,
    ) -> Result<(), DriverError> {
        self.inner.activate(handler)
    }

    fn deactivate(&self) {
        self.flush();
        self.inner.deactivate();
    }

    fn transmit(&self, data: &[u8], handles: Vec<DriverHandle>) -> Result<(), DriverError> {
        let swap_with = {
            let mut state = self.state.lock();
            if !state.passed_first {
                // The greeting must arrive first; everything after is fair
                // game.
                state.passed_first = true;
                None
            } else {
                match state.held.take() {
                    None => {
                        state.held = Some((data.to_vec(), handles));
                        return Ok(());
                    }
                    Some(previous) => Some(previous),
                }
            }
        };
        self.inner.transmit(data, handles)?;
        if let Some((previous_data, previous_handles)) = swap_with {
            self.inner.transmit(&previous_data, previous_handles)?;
        }
        Ok(())
    }
}

/// Driver producing [`ReorderingTransport`] pairs over in-process
/// endpoints.
#[derive(Default)]
pub struct ReorderingDriver {
    inner: SingleProcessDriver,
    transports: Mutex<Vec<Arc<ReorderingTransport>>>,
}

impl ReorderingDriver {
    /// Delivers every held-back frame on every transport.
    pub fn flush_all(&self) {
        let transports = self.transports.lock().clone();
        for transport in transports {
            transport.flush();
        }
    }
}

impl Driver for ReorderingDriver {
    fn create_transports(
        &self,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), DriverError> {
        let (a, b) = self.inner.create_transports()?;
        let a = ReorderingTransport::wrap(a);
        let b = ReorderingTransport::wrap(b);
        let mut transports = self.transports.lock();
        transports.push(a.clone());
        transports.push(b.clone());
        Ok((a, b))
    }

    fn allocate_shared_memory(&self, len: usize) -> Result<SharedRegion, DriverError> {
        self.inner.allocate_shared_memory(len)
    }
}
