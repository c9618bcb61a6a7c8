use lan_social_lib::discovery::{DiscoveryContext, SelfAddrs};
use lan_social_lib::protocol::Packet;
use lan_social_lib::{Event, EventQueue, NodeId, PeerSource, PeerTable};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const DISCOVERY_PORT: u16 = 38655;

struct Node {
    ctx: DiscoveryContext,
    events: EventQueue,
    addr: IpAddr,
}

fn node(name: &str, last_octet: u8, chat_port: u16) -> Node {
    let (tx, events) = EventQueue::channel();
    let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet));
    let local = SelfAddrs::default();
    local.replace([addr].into_iter().collect());
    Node {
        ctx: DiscoveryContext {
            node_id: NodeId::generate(),
            name: name.to_string(),
            chat_port,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DISCOVERY_PORT,
            peers: PeerTable::new(),
            events: tx,
            local,
        },
        events,
        addr,
    }
}

fn with_chat_port(n: &Node, chat_port: u16) -> DiscoveryContext {
    DiscoveryContext {
        node_id: n.ctx.node_id.clone(),
        name: n.ctx.name.clone(),
        chat_port,
        bind_ip: n.ctx.bind_ip,
        discovery_port: n.ctx.discovery_port,
        peers: PeerTable::new(),
        events: n.ctx.events.clone(),
        local: SelfAddrs::default(),
    }
}

fn peer_ups(events: &EventQueue) -> usize {
    events
        .drain()
        .iter()
        .filter(|e| matches!(e, Event::PeerUp(_)))
        .count()
}

#[test]
fn probe_reply_converges_both_tables() {
    let x = node("x", 10, 38600);
    let y = node("y", 20, 38601);

    // X's broadcast probe arrives at Y from an ephemeral sender port.
    let probe = x.ctx.probe().to_bytes().unwrap();
    let (reply, reply_to) = y
        .ctx
        .handle_datagram(&probe, SocketAddr::new(x.addr, 51515))
        .expect("probe should be answered");
    assert_eq!(reply_to, SocketAddr::new(x.addr, DISCOVERY_PORT));

    // Y's directed announce reaches X.
    assert!(x
        .ctx
        .handle_datagram(&reply, SocketAddr::new(y.addr, DISCOVERY_PORT))
        .is_none());

    let y_at_x = x.ctx.peers.get("192.168.1.20:38601").unwrap();
    assert_eq!(y_at_x.source, PeerSource::Lan);
    assert_eq!(y_at_x.name, "y");
    assert_eq!(y_at_x.node_id, y.ctx.node_id.as_str());
    assert_eq!(peer_ups(&x.events), 1);

    let x_at_y = y.ctx.peers.get("192.168.1.10:38600").unwrap();
    assert_eq!(x_at_y.node_id, x.ctx.node_id.as_str());
}

#[test]
fn restarted_chat_port_updates_the_same_entry() {
    let x = node("x", 10, 38600);
    let y = node("y", 20, 38601);
    let from_y = SocketAddr::new(y.addr, DISCOVERY_PORT);

    let first = y.ctx.announce().to_bytes().unwrap();
    x.ctx.handle_datagram(&first, from_y);
    assert_eq!(x.ctx.peers.len(), 1);

    // Y's chat server came back on another port; the announce says so.
    let moved = with_chat_port(&y, 38605).announce().to_bytes().unwrap();
    x.ctx.handle_datagram(&moved, from_y);

    let peers = x.ctx.peers.snapshot();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].port, 38605);
    assert_eq!(peers[0].node_id, y.ctx.node_id.as_str());

    // Anyone listing peers by endpoint sees the old one go away before the new one shows up.
    let seen: Vec<String> = x
        .events
        .drain()
        .iter()
        .map(|e| match e {
            Event::PeerUp(p) => format!("up {}", p.key()),
            Event::PeerDown(p) => format!("down {}", p.key()),
            other => format!("{:?}", other),
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            "up 192.168.1.20:38601",
            "down 192.168.1.20:38601",
            "up 192.168.1.20:38605",
        ]
    );
}

#[test]
fn self_packets_never_reach_the_table() {
    let x = node("x", 10, 38600);

    for packet in [x.ctx.announce(), x.ctx.probe()] {
        let bytes = packet.to_bytes().unwrap();
        // Own broadcast looping back through a physical interface.
        assert!(x.ctx.handle_datagram(&bytes, SocketAddr::new(x.addr, DISCOVERY_PORT)).is_none());
        // Own broadcast seen via loopback.
        let lo = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DISCOVERY_PORT);
        assert!(x.ctx.handle_datagram(&bytes, lo).is_none());
        // Own node id relayed from elsewhere.
        let elsewhere = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99)), DISCOVERY_PORT);
        assert!(x.ctx.handle_datagram(&bytes, elsewhere).is_none());
    }

    assert!(x.ctx.peers.is_empty());
    assert_eq!(peer_ups(&x.events), 0);
}

#[test]
fn announce_packets_carry_reachability() {
    let x = node("x", 10, 38600);
    let Packet::Announce(presence) = x.ctx.announce() else {
        panic!("announce() built the wrong packet");
    };
    assert_eq!(presence.chat_port, 38600);
    assert_eq!(presence.reply_port, 38600);
    assert_eq!(presence.node_id, x.ctx.node_id.as_str());
    assert!(presence.ts > 0.0);
}
