//! LAN discovery over UDP broadcast.
//!
//! The broadcaster announces this node to the global broadcast address and to every
//! subnet broadcast of the local interfaces; every other tick it probes first so
//! nodes that just started get a direct reply instead of waiting for the next round.
//! The listener turns what it hears into peer table updates.

use crate::config::{ANNOUNCE_INTERVAL, INTERFACE_REFRESH_TICKS, MAX_DATAGRAM};
use crate::error::EngineError;
use crate::events::EventSender;
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::protocol::{now_ts, Packet, Presence};
use crate::state::PeerTable;
use ipnetwork::Ipv4Network;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Addresses and broadcast targets of this machine at scan time.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    pub addrs: HashSet<IpAddr>,
    pub broadcasts: BTreeSet<Ipv4Addr>,
}

pub fn scan_interfaces() -> Interfaces {
    let mut found = Interfaces::default();

    match local_ip_address::list_afinet_netifas() {
        Ok(list) => found.addrs.extend(list.into_iter().map(|(_, ip)| ip)),
        Err(e) => tracing::debug!("Failed to list local addresses: {}", e),
    }

    match NetworkInterface::show() {
        Ok(ifaces) => {
            for itf in ifaces {
                for addr in itf.addr {
                    let Addr::V4(v4) = addr else { continue };
                    found.addrs.insert(IpAddr::V4(v4.ip));
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    if let Some(brd) = subnet_broadcast(v4.ip, v4.broadcast, v4.netmask) {
                        found.broadcasts.insert(brd);
                    }
                }
            }
        }
        Err(e) => tracing::debug!("Failed to enumerate interfaces: {}", e),
    }

    found
}

/// Broadcast address for one interface: whatever the OS reports, else derived from the netmask.
pub fn subnet_broadcast(
    ip: Ipv4Addr,
    reported: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    if let Some(brd) = reported.filter(|b| !b.is_unspecified() && *b != ip) {
        return Some(brd);
    }
    let net = Ipv4Network::with_netmask(ip, netmask?).ok()?;
    // /31 and /32 links have no broadcast.
    if net.prefix() >= 31 {
        return None;
    }
    Some(net.broadcast())
}

/// Global broadcast first, then each subnet broadcast once.
pub fn broadcast_targets(subnets: &BTreeSet<Ipv4Addr>, port: u16) -> Vec<SocketAddr> {
    std::iter::once(Ipv4Addr::BROADCAST)
        .chain(subnets.iter().copied().filter(|b| *b != Ipv4Addr::BROADCAST))
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

/// This machine's addresses, refreshed by the broadcaster and read by the listener.
#[derive(Clone, Default)]
pub struct SelfAddrs(Arc<RwLock<HashSet<IpAddr>>>);

impl SelfAddrs {
    pub fn replace(&self, addrs: HashSet<IpAddr>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = addrs;
    }

    /// Loopback and unspecified always count as self.
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_loopback()
            || ip.is_unspecified()
            || self.0.read().unwrap_or_else(|e| e.into_inner()).contains(&ip)
    }
}

/// Everything the discovery workers share.
pub struct DiscoveryContext {
    pub node_id: NodeId,
    pub name: String,
    /// 0 when the chat server could not start.
    pub chat_port: u16,
    pub bind_ip: IpAddr,
    pub discovery_port: u16,
    pub peers: PeerTable,
    pub events: EventSender,
    pub local: SelfAddrs,
}

impl DiscoveryContext {
    pub fn presence(&self) -> Presence {
        Presence {
            node_id: self.node_id.to_string(),
            name: self.name.clone(),
            chat_port: self.chat_port,
            reply_port: self.chat_port,
            ts: now_ts(),
        }
    }

    pub fn announce(&self) -> Packet {
        Packet::Announce(self.presence())
    }

    pub fn probe(&self) -> Packet {
        Packet::Probe(self.presence())
    }

    /// Processes one received datagram. Returns a directed reply to send, if any.
    pub fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> Option<(Vec<u8>, SocketAddr)> {
        if self.local.contains(src.ip()) {
            tracing::trace!("Dropping own datagram from {}", src);
            return None;
        }
        let packet = Packet::from_bytes(data)?;

        match packet {
            Packet::Probe(presence) => {
                if self.node_id.is(&presence.node_id) {
                    return None;
                }
                tracing::debug!("Probe from {} ({})", presence.name, src);
                self.learn(&presence, src.ip());
                // Discovery replies go to the discovery port, not whatever port the probe left from.
                let reply_to = SocketAddr::new(src.ip(), self.discovery_port);
                match self.announce().to_bytes() {
                    Ok(bytes) => Some((bytes, reply_to)),
                    Err(e) => {
                        tracing::warn!("Failed to encode announce: {}", e);
                        None
                    }
                }
            }
            Packet::Announce(presence) => {
                if !self.node_id.is(&presence.node_id) {
                    self.learn(&presence, src.ip());
                }
                None
            }
            Packet::Chat(_) => None,
        }
    }

    fn learn(&self, presence: &Presence, ip: IpAddr) {
        if presence.chat_port == 0 {
            return;
        }
        let peer = Peer::lan(
            presence.name.as_str(),
            ip.to_string(),
            presence.chat_port,
            presence.node_id.as_str(),
        );
        if self.peers.upsert(peer.clone()).notify(&peer, &self.events) {
            tracing::info!("Discovered peer {} at {}", peer.name, peer.key());
        }
    }
}

async fn send_all(socket: &UdpSocket, packet: &Packet, targets: &[SocketAddr]) {
    let bytes = match packet.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to encode discovery packet: {}", e);
            return;
        }
    };
    for target in targets {
        // One unreachable subnet must not stop the others.
        if let Err(e) = socket.send_to(&bytes, target).await {
            tracing::trace!("Broadcast to {} failed: {}", target, e);
        }
    }
}

pub async fn run_broadcaster(ctx: Arc<DiscoveryContext>, cancel: CancellationToken) {
    let socket = match UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await {
        Ok(s) => s,
        Err(e) => {
            let err = EngineError::bind("discovery sender", e);
            tracing::warn!("{}", err);
            ctx.events.status(format!("Discovery broadcast unavailable: {}", err));
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tracing::warn!("Discovery sender set_broadcast failed: {}", e);
        ctx.events.status(format!("Discovery broadcast unavailable: {}", e));
        return;
    }

    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut tick: u64 = 0;
    let mut targets = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if tick % INTERFACE_REFRESH_TICKS == 0 {
                    let found = tokio::task::spawn_blocking(scan_interfaces)
                        .await
                        .unwrap_or_default();
                    targets = broadcast_targets(&found.broadcasts, ctx.discovery_port);
                    tracing::debug!("Broadcast targets: {:?}", targets);
                    ctx.local.replace(found.addrs);
                }
                if tick % 2 == 0 {
                    send_all(&socket, &ctx.probe(), &targets).await;
                }
                send_all(&socket, &ctx.announce(), &targets).await;
                tick = tick.wrapping_add(1);
            }
        }
    }
    tracing::debug!("Discovery broadcaster stopped");
}

pub async fn run_listener(ctx: Arc<DiscoveryContext>, cancel: CancellationToken) {
    let addr = SocketAddr::new(ctx.bind_ip, ctx.discovery_port);
    let socket = match UdpSocket::bind(addr).await {
        Ok(s) => s,
        Err(e) => {
            let err = EngineError::bind(format!("discovery listener on {}", addr), e);
            tracing::warn!("{}", err);
            ctx.events.status(format!(
                "Discovery port {} unavailable ({}); peers will not be discovered",
                ctx.discovery_port, err
            ));
            return;
        }
    };
    tracing::info!("Discovery listening on {}", addr);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms.
                        tracing::trace!("Discovery recv error: {}", e);
                        continue;
                    }
                };
                if let Some((reply, to)) = ctx.handle_datagram(&buf[..len], src) {
                    if let Err(e) = socket.send_to(&reply, to).await {
                        tracing::debug!("Probe reply to {} failed: {}", to, e);
                    }
                }
            }
        }
    }
    tracing::debug!("Discovery listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventQueue};

    fn context(name: &str, chat_port: u16) -> (DiscoveryContext, EventQueue) {
        let (events, queue) = EventQueue::channel();
        let ctx = DiscoveryContext {
            node_id: NodeId::generate(),
            name: name.to_string(),
            chat_port,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: 38655,
            peers: PeerTable::new(),
            events,
            local: SelfAddrs::default(),
        };
        (ctx, queue)
    }

    fn lan_addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), port)
    }

    #[test]
    fn broadcast_from_netmask() {
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        let mask = Some(Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet_broadcast(ip, None, mask), Some(Ipv4Addr::new(192, 168, 1, 255)));

        let mask = Some(Ipv4Addr::new(255, 255, 240, 0));
        let ip = Ipv4Addr::new(10, 1, 17, 3);
        assert_eq!(subnet_broadcast(ip, None, mask), Some(Ipv4Addr::new(10, 1, 31, 255)));

        let reported = Some(Ipv4Addr::new(10, 1, 31, 255));
        assert_eq!(subnet_broadcast(ip, reported, None), reported);
        assert_eq!(subnet_broadcast(ip, None, None), None);
        assert_eq!(subnet_broadcast(ip, None, Some(Ipv4Addr::BROADCAST)), None);
    }

    #[test]
    fn targets_start_with_global_broadcast() {
        let subnets: BTreeSet<_> = [Ipv4Addr::new(192, 168, 1, 255), Ipv4Addr::BROADCAST]
            .into_iter()
            .collect();
        let targets = broadcast_targets(&subnets, 38655);
        assert_eq!(
            targets,
            vec![
                "255.255.255.255:38655".parse::<SocketAddr>().unwrap(),
                "192.168.1.255:38655".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn probe_gets_directed_announce_and_is_learned() {
        let (x, _) = context("x", 38601);
        let (y, y_events) = context("y", 38602);

        let probe = x.probe().to_bytes().unwrap();
        let (reply, to) = y.handle_datagram(&probe, lan_addr(10, 50123)).unwrap();
        assert_eq!(to, lan_addr(10, 38655));
        assert!(matches!(Packet::from_bytes(&reply), Some(Packet::Announce(p)) if p.node_id == y.node_id.as_str()));

        let learned = y.peers.get("192.168.1.10:38601").unwrap();
        assert_eq!(learned.name, "x");
        assert_eq!(learned.node_id, x.node_id.as_str());
        assert_eq!(y_events.drain().len(), 1);
    }

    #[test]
    fn repeated_announce_is_one_event() {
        let (x, _) = context("x", 38601);
        let (y, y_events) = context("y", 38602);
        let announce = x.announce().to_bytes().unwrap();

        assert!(y.handle_datagram(&announce, lan_addr(10, 38655)).is_none());
        assert!(y.handle_datagram(&announce, lan_addr(10, 38655)).is_none());
        assert_eq!(y.peers.len(), 1);
        assert_eq!(y_events.drain().len(), 1);
    }

    #[test]
    fn own_packets_are_dropped() {
        let (x, events) = context("x", 38601);
        let announce = x.announce().to_bytes().unwrap();
        let probe = x.probe().to_bytes().unwrap();

        // Own node id arriving from a foreign-looking address.
        assert!(x.handle_datagram(&announce, lan_addr(10, 38655)).is_none());
        assert!(x.handle_datagram(&probe, lan_addr(10, 38655)).is_none());

        // Someone else's packet arriving from one of our own addresses.
        let (other, _) = context("other", 38602);
        let foreign = other.announce().to_bytes().unwrap();
        x.local.replace([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))].into_iter().collect());
        assert!(x.handle_datagram(&foreign, lan_addr(77, 38655)).is_none());
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 38655);
        assert!(x.handle_datagram(&foreign, loopback).is_none());

        assert!(x.peers.is_empty());
        assert!(events.drain().is_empty());
    }

    #[test]
    fn degraded_peers_and_junk_are_not_learned() {
        let (x, _) = context("x", 0);
        let (y, events) = context("y", 38602);

        let announce = x.announce().to_bytes().unwrap();
        assert!(y.handle_datagram(&announce, lan_addr(10, 38655)).is_none());

        // A probe without a chat port still gets answered.
        let probe = x.probe().to_bytes().unwrap();
        assert!(y.handle_datagram(&probe, lan_addr(10, 38655)).is_some());

        assert!(y.handle_datagram(b"{\"type\":\"hello\"}", lan_addr(10, 38655)).is_none());
        assert!(y.handle_datagram(b"\xff\xfe", lan_addr(10, 38655)).is_none());

        assert!(y.peers.is_empty());
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn listener_reports_taken_port() {
        let taken = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let (mut ctx, queue) = context("x", 38601);
        ctx.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        ctx.discovery_port = taken.local_addr().unwrap().port();

        // Returns straight away instead of looping.
        run_listener(Arc::new(ctx), CancellationToken::new()).await;

        let events = queue.drain();
        assert!(
            matches!(events.as_slice(), [Event::Status(s)] if s.contains("unavailable") && s.contains("failed to bind")),
            "unexpected events: {:?}",
            events
        );
    }
}
