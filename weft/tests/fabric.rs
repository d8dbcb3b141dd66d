//! End-to-end scenarios across one or more nodes.

mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use weft::{
    trap_conditions, Driver, Limits, Node, NodeConfig, NodeType, PortalError, RoutingMode,
    SingleProcessDriver, TrapConditions,
};

use support::{connect_pair, new_node, ReorderingDriver};

#[test]
fn test_local_echo() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    let weak_a = a.downgrade();
    let weak_b = b.downgrade();

    a.put(b"hello", Vec::new(), Vec::new(), None).expect("put");
    let status = b.query_status();
    assert_eq!(status.num_local_parcels, 1);
    assert_eq!(status.num_local_bytes, 5);

    let message = b.get().expect("get");
    assert_eq!(&message.data[..], b"hello");
    assert!(message.portals.is_empty());

    a.close();
    b.close();
    assert!(weak_a.upgrade().is_none(), "closed router should be freed");
    assert!(weak_b.upgrade().is_none(), "closed router should be freed");
}

#[test]
fn test_closure_mid_sequence() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    a.put(b"p0", Vec::new(), Vec::new(), None).expect("put");
    a.put(b"p1", Vec::new(), Vec::new(), None).expect("put");
    a.close();

    assert_eq!(&b.get().expect("get").data[..], b"p0");
    assert_eq!(&b.get().expect("get").data[..], b"p1");
    let status = b.query_status();
    assert!(status.is_peer_closed());
    assert!(status.is_dead());
    assert!(matches!(b.get(), Err(PortalError::NotFound)));
}

#[test]
fn test_initial_portals_carry_traffic() {
    let driver = Arc::new(SingleProcessDriver);
    let broker = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let normal = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());

    let (mut broker_portals, mut normal_portals) = connect_pair(&driver, &broker, &normal, 1);
    let on_broker = broker_portals.remove(0);
    let on_normal = normal_portals.remove(0);

    on_broker
        .put(b"ping", Vec::new(), Vec::new(), None)
        .expect("put");
    assert_eq!(&on_normal.get().expect("get").data[..], b"ping");

    on_normal
        .put(b"pong", Vec::new(), Vec::new(), None)
        .expect("put");
    assert_eq!(&on_broker.get().expect("get").data[..], b"pong");
}

#[test]
fn test_puts_buffer_until_connection_completes() {
    let driver = Arc::new(SingleProcessDriver);
    let broker = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let normal = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());

    let (t1, t2) = driver.create_transports().expect("transports");
    let mut broker_portals = broker.connect_node(t1, 1).expect("connect");
    let on_broker = broker_portals.remove(0);

    // The peer has not connected yet; the put buffers on the router.
    on_broker
        .put(b"early", Vec::new(), Vec::new(), None)
        .expect("put");

    let mut normal_portals = normal.connect_node(t2, 1).expect("connect");
    let on_normal = normal_portals.remove(0);
    assert_eq!(&on_normal.get().expect("get").data[..], b"early");
}

#[test]
fn test_portal_transfer_retires_proxy_and_preserves_order() {
    let driver = Arc::new(SingleProcessDriver);
    let node_x = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_y = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());
    let (mut x_portals, mut y_portals) = connect_pair(&driver, &node_x, &node_y, 1);
    let chan_x = x_portals.remove(0);
    let chan_y = y_portals.remove(0);

    // A route entirely on X, whose B side we ship to Y.
    let (a, b) = node_x.open_portals();
    let proxy_weak = b.downgrade();

    chan_x
        .put(b"moving", vec![b], Vec::new(), None)
        .expect("transfer");
    a.put(b"a", Vec::new(), Vec::new(), None).expect("put");
    a.put(b"b", Vec::new(), Vec::new(), None).expect("put");

    let mut message = chan_y.get().expect("get");
    assert_eq!(&message.data[..], b"moving");
    assert_eq!(message.portals.len(), 1);
    let b_on_y = message.portals.remove(0);

    a.put(b"c", Vec::new(), Vec::new(), None).expect("put");

    assert_eq!(&b_on_y.get().expect("get").data[..], b"a");
    assert_eq!(&b_on_y.get().expect("get").data[..], b"b");
    assert_eq!(&b_on_y.get().expect("get").data[..], b"c");

    // The router left behind on X has fully retired.
    assert!(
        proxy_weak.upgrade().is_none(),
        "the moved router should be unreachable once bypassed"
    );

    // And the route still works in both directions.
    b_on_y.put(b"up", Vec::new(), Vec::new(), None).expect("put");
    assert_eq!(&a.get().expect("get").data[..], b"up");
}

#[test]
fn test_double_hop_transfer_with_introduction() {
    let driver = Arc::new(SingleProcessDriver);
    let broker = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_y = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());
    let node_z = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());

    let (mut x_to_y, mut y_portals) = connect_pair(&driver, &broker, &node_y, 1);
    let (mut x_to_z, mut z_portals) = connect_pair(&driver, &broker, &node_z, 1);
    let chan_xy = x_to_y.remove(0);
    let chan_y = y_portals.remove(0);
    let chan_xz = x_to_z.remove(0);
    let chan_z = z_portals.remove(0);

    // Open a pair on the broker, ship one end to Y and the other to Z.
    // The second transfer leaves a proxy on the broker that Y and Z must
    // bypass by being introduced to each other.
    let (p, q) = broker.open_portals();
    let p_weak = p.downgrade();
    let q_weak = q.downgrade();

    chan_xy.put(b"p", vec![p], Vec::new(), None).expect("send p");
    let mut message = chan_y.get().expect("get p");
    let p_on_y = message.portals.remove(0);

    chan_xz.put(b"q", vec![q], Vec::new(), None).expect("send q");
    let mut message = chan_z.get().expect("get q");
    let q_on_z = message.portals.remove(0);

    // Traffic flows end to end in both directions, in order.
    p_on_y
        .put(b"from-y-1", Vec::new(), Vec::new(), None)
        .expect("put");
    p_on_y
        .put(b"from-y-2", Vec::new(), Vec::new(), None)
        .expect("put");
    q_on_z
        .put(b"from-z-1", Vec::new(), Vec::new(), None)
        .expect("put");

    assert_eq!(&q_on_z.get().expect("get").data[..], b"from-y-1");
    assert_eq!(&q_on_z.get().expect("get").data[..], b"from-y-2");
    assert_eq!(&p_on_y.get().expect("get").data[..], b"from-z-1");

    // Both routers that stayed behind on the broker have retired.
    assert!(p_weak.upgrade().is_none(), "p's old router should retire");
    assert!(q_weak.upgrade().is_none(), "q's old router should retire");

    // More traffic after the bypass settles still arrives in order.
    p_on_y
        .put(b"late", Vec::new(), Vec::new(), None)
        .expect("put");
    assert_eq!(&q_on_z.get().expect("get").data[..], b"late");
}

#[test]
fn test_transport_reordering_is_hidden_by_sequencing() {
    let driver = Arc::new(ReorderingDriver::default());
    let node_a = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_b = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());

    let (t1, t2) = driver.create_transports().expect("transports");
    let mut a_portals = node_a.connect_node(t1, 1).expect("connect");
    let mut b_portals = node_b.connect_node(t2, 1).expect("connect");
    let on_a = a_portals.remove(0);
    let on_b = b_portals.remove(0);

    for i in 0..8u8 {
        on_a.put(&[i], Vec::new(), Vec::new(), None).expect("put");
    }
    // Flush any frame the reordering transport is still holding back.
    driver.flush_all();

    for i in 0..8u8 {
        assert_eq!(&on_b.get().expect("get").data[..], &[i]);
    }
}

#[test]
fn test_limits_are_enforced() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    let limits = Limits {
        max_queued_parcels: 2,
        max_queued_bytes: 1024,
    };
    a.put(b"1", Vec::new(), Vec::new(), Some(&limits)).expect("put");
    a.put(b"2", Vec::new(), Vec::new(), Some(&limits)).expect("put");
    assert!(matches!(
        a.put(b"3", Vec::new(), Vec::new(), Some(&limits)),
        Err(PortalError::ResourceExhausted)
    ));
    let _ = b.get().expect("get");
    a.put(b"3", Vec::new(), Vec::new(), Some(&limits)).expect("put");
}

#[test]
fn test_portal_cannot_travel_through_itself_or_its_peer() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    // Sending b through a would send it through its own peer.
    match a.put(b"x", vec![b], Vec::new(), None) {
        Err(PortalError::InvalidArgument { .. }) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn test_serialized_portal_round_trips_through_a_parcel() {
    let driver = Arc::new(SingleProcessDriver);
    let node_x = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_y = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());
    let (mut x_portals, mut y_portals) = connect_pair(&driver, &node_x, &node_y, 1);
    let chan_x = x_portals.remove(0);
    let chan_y = y_portals.remove(0);

    let (a, b) = node_x.open_portals();
    a.put(b"before", Vec::new(), Vec::new(), None).expect("put");

    // Ship b to Y and immediately back to X: same route, same peer, same
    // sequence position.
    chan_x.put(b"", vec![b], Vec::new(), None).expect("to y");
    let mut message = chan_y.get().expect("get");
    let b_on_y = message.portals.remove(0);
    chan_y.put(b"", vec![b_on_y], Vec::new(), None).expect("back");
    let mut message = chan_x.get().expect("get");
    let b_back = message.portals.remove(0);

    assert_eq!(&b_back.get().expect("get").data[..], b"before");
    a.put(b"after", Vec::new(), Vec::new(), None).expect("put");
    assert_eq!(&b_back.get().expect("get").data[..], b"after");
}

#[test]
fn test_shutdown_reports_loss_as_peer_closure() {
    let driver = Arc::new(SingleProcessDriver);
    let node_x = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_y = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());
    let (mut x_portals, _y_portals) = connect_pair(&driver, &node_x, &node_y, 1);
    let chan_x = x_portals.remove(0);

    chan_x
        .put(b"doomed", Vec::new(), Vec::new(), None)
        .expect("put");
    node_y.shutdown();

    let status = chan_x.query_status();
    assert!(status.is_peer_closed());
    assert!(status.is_dead());
    assert!(matches!(chan_x.get(), Err(PortalError::NotFound)));
}

#[test]
fn test_trap_fires_once_and_rearms_after_read() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    let b = Arc::new(b);

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    let trap_slot: Arc<OnceLock<Arc<weft::Trap>>> = Arc::new(OnceLock::new());
    let rearm_results: Arc<Mutex<Vec<Result<(), PortalError>>>> =
        Arc::new(Mutex::new(Vec::new()));

    let handler_b = b.clone();
    let handler_slot = trap_slot.clone();
    let handler_results = rearm_results.clone();
    let trap = b.create_trap(
        TrapConditions {
            flags: trap_conditions::LOCAL_PARCELS,
            min_local_parcels: 1,
            min_local_bytes: 0,
        },
        Box::new(move |event| {
            assert_ne!(event.condition_flags & trap_conditions::LOCAL_PARCELS, 0);
            FIRED.fetch_add(1, Ordering::SeqCst);
            if let Some(trap) = handler_slot.get() {
                handler_results
                    .lock()
                    .expect("results lock")
                    .push(handler_b.arm_trap(trap));
            }
        }),
    );
    let _ = trap_slot.set(trap.clone());

    b.arm_trap(&trap).expect("arm");
    a.put(b"x", Vec::new(), Vec::new(), None).expect("put");

    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    // Re-arming inside the handler failed: the parcel was still queued.
    {
        let results = rearm_results.lock().expect("results lock");
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(PortalError::FailedPrecondition { .. })
        ));
    }

    // Arming again before the read still fails; after the read it works
    // and a new put fires the handler once more.
    assert!(matches!(
        b.arm_trap(&trap),
        Err(PortalError::FailedPrecondition { .. })
    ));
    let _ = b.get().expect("get");
    b.arm_trap(&trap).expect("re-arm after read");
    a.put(b"y", Vec::new(), Vec::new(), None).expect("put");
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
}

#[test]
fn test_blocking_trap_destroy_waits_for_handler() {
    let node = new_node(NodeType::Broker);
    let (a, b) = node.open_portals();
    let b = Arc::new(b);

    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let handler_entered = entered.clone();
    let handler_finished = finished.clone();
    let trap = b.create_trap(
        TrapConditions {
            flags: trap_conditions::LOCAL_PARCELS,
            min_local_parcels: 1,
            min_local_bytes: 0,
        },
        Box::new(move |_event| {
            handler_entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            handler_finished.store(true, Ordering::SeqCst);
        }),
    );
    b.arm_trap(&trap).expect("arm");

    let putter = std::thread::spawn(move || {
        a.put(b"x", Vec::new(), Vec::new(), None).expect("put");
        a
    });

    while !entered.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
    b.destroy_trap(&trap, true);
    assert!(
        finished.load(Ordering::SeqCst),
        "blocking destroy must wait for the in-flight handler"
    );
    let a = putter.join().expect("putter");
    drop(a);
}

#[test]
fn test_merged_routes_behave_as_one() {
    let node = new_node(NodeType::Broker);
    let (a1, b1) = node.open_portals();
    let (a2, b2) = node.open_portals();
    b1.merge(b2).expect("merge");

    a1.put(b"one way", Vec::new(), Vec::new(), None).expect("put");
    assert_eq!(&a2.get().expect("get").data[..], b"one way");
    a2.put(b"other way", Vec::new(), Vec::new(), None).expect("put");
    assert_eq!(&a1.get().expect("get").data[..], b"other way");

    a1.close();
    let status = a2.query_status();
    assert!(status.is_peer_closed());
}

#[test]
fn test_transferred_portal_routing_mode_settles_active() {
    let driver = Arc::new(SingleProcessDriver);
    let node_x = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let node_y = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());
    let (mut x_portals, mut y_portals) = connect_pair(&driver, &node_x, &node_y, 1);
    let chan_x = x_portals.remove(0);
    let chan_y = y_portals.remove(0);

    let (a, b) = node_x.open_portals();
    chan_x.put(b"", vec![b], Vec::new(), None).expect("transfer");
    let mut message = chan_y.get().expect("get");
    let b_on_y = message.portals.remove(0);

    let router = b_on_y.downgrade().upgrade().expect("router alive");
    assert_eq!(router.routing_mode(), RoutingMode::Active);
    drop(a);
}
