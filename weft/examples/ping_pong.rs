//! Two nodes, one portal pair, and a portal that changes nodes mid-game.
//!
//! Run with: `cargo run --example ping_pong`

use std::sync::Arc;

use weft::{Node, NodeConfig, NodeType, SingleProcessDriver};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let driver = Arc::new(SingleProcessDriver);
    let broker = Node::create(driver.clone(), NodeType::Broker, NodeConfig::default());
    let player = Node::create(driver.clone(), NodeType::Normal, NodeConfig::default());

    // One channel between the nodes, established over a transport pair.
    let (t1, t2) = weft::Driver::create_transports(&*driver).expect("transports");
    let mut broker_portals = broker.connect_node(t1, 1).expect("connect broker");
    let mut player_portals = player.connect_node(t2, 1).expect("connect player");
    let channel_b = broker_portals.remove(0);
    let channel_p = player_portals.remove(0);

    // A rally on the broker, then the far end of the table moves nodes.
    let (ping, pong) = broker.open_portals();
    ping.put(b"ping 1", Vec::new(), Vec::new(), None).expect("serve");

    channel_b
        .put(b"table moved", vec![pong], Vec::new(), None)
        .expect("transfer");
    let mut delivery = channel_p.get().expect("receive transfer");
    let pong = delivery.portals.remove(0);

    // The route now runs between nodes; the stay-behind router retires on
    // its own and traffic keeps flowing in order.
    ping.put(b"ping 2", Vec::new(), Vec::new(), None).expect("serve");
    println!("{}", String::from_utf8_lossy(&pong.get().expect("return").data));
    println!("{}", String::from_utf8_lossy(&pong.get().expect("return").data));

    pong.put(b"pong", Vec::new(), Vec::new(), None).expect("return");
    println!("{}", String::from_utf8_lossy(&ping.get().expect("rally").data));
}
