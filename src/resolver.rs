//! Picks which endpoints to try when sending to a peer whose address may have drifted
//! since it was shown to the user.

use crate::peer::{Peer, PeerSource};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub const RANK_EXACT: u8 = 0;
pub const RANK_NODE_ID: u8 = 1;
pub const RANK_SAME_HOST: u8 = 2;
pub const RANK_SAME_NAME: u8 = 3;
pub const RANK_UNRELATED: u8 = 9;

/// VirtualBox's default NAT subnet. Guests there all look alike and are rarely reachable.
const VIRTUAL_NAT: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 0, 2, 0), 24);

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rank: u8,
    pub peer: Peer,
}

/// How `other` relates to the peer the user selected. Lower is closer.
pub fn rank(selected: &Peer, other: &Peer) -> u8 {
    if selected.same_endpoint(other) {
        RANK_EXACT
    } else if !selected.node_id.is_empty() && selected.node_id == other.node_id {
        RANK_NODE_ID
    } else if selected.host == other.host {
        RANK_SAME_HOST
    } else if other.source == PeerSource::Lan
        && !selected.name.trim().is_empty()
        && selected.name.trim().to_lowercase() == other.name.trim().to_lowercase()
    {
        RANK_SAME_NAME
    } else {
        RANK_UNRELATED
    }
}

/// 0 is a normal address; loopback and the virtual NAT range sort last within a rank.
pub fn host_quality(host: &str) -> u8 {
    if host.starts_with("127.") || host.eq_ignore_ascii_case("localhost") {
        return 2;
    }
    match host.parse::<Ipv4Addr>() {
        Ok(ip) if in_virtual_nat(ip) => 1,
        _ => 0,
    }
}

fn in_virtual_nat(ip: Ipv4Addr) -> bool {
    Ipv4Network::new(VIRTUAL_NAT.0, VIRTUAL_NAT.1)
        .map(|net| net.contains(ip))
        .unwrap_or(false)
}

/// Ordered, de-duplicated endpoints to try for `selected`.
///
/// Related peers (rank 0-3) come first. The selected endpoint is always tried: if it
/// is no longer in `known` it is appended last, at `RANK_UNRELATED`.
pub fn resolve(selected: &Peer, known: &[Peer]) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = known
        .iter()
        .map(|peer| Candidate {
            rank: rank(selected, peer),
            peer: peer.clone(),
        })
        .filter(|c| c.rank < RANK_UNRELATED)
        .collect();

    ranked.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| host_quality(&a.peer.host).cmp(&host_quality(&b.peer.host)))
            .then_with(|| a.peer.host.cmp(&b.peer.host))
            .then_with(|| a.peer.port.cmp(&b.peer.port))
    });

    let mut seen = HashSet::new();
    ranked.retain(|c| seen.insert(c.peer.key()));

    if !seen.contains(&selected.key()) {
        ranked.push(Candidate {
            rank: RANK_UNRELATED,
            peer: selected.clone(),
        });
    }
    ranked
}
