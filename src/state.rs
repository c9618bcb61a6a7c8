use crate::config::{GC_INTERVAL, PEER_TIMEOUT};
use crate::events::{Event, EventSender};
use crate::peer::{Peer, PeerSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What an upsert did to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    /// Only `last_seen` was refreshed.
    Unchanged,
    /// New entry, or its name/node id changed.
    Changed,
    /// The node re-appeared on another chat port; holds the entry as it was under the old key.
    Moved(Peer),
}

impl Upsert {
    pub fn is_change(&self) -> bool {
        !matches!(self, Upsert::Unchanged)
    }

    /// Reports the outcome for `peer`: `PeerDown` for a vacated endpoint, then `PeerUp`.
    /// Returns whether anything was sent.
    pub fn notify(self, peer: &Peer, events: &EventSender) -> bool {
        match self {
            Upsert::Unchanged => return false,
            Upsert::Changed => {}
            Upsert::Moved(old) => events.send(Event::PeerDown(old)),
        }
        events.send(Event::PeerUp(peer.clone()));
        true
    }
}

/// Every peer this node knows about, keyed by `host:port`.
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<Mutex<HashMap<String, Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or merges `peer` under its own key.
    pub fn upsert(&self, peer: Peer) -> Upsert {
        let key = peer.key();
        let mut peers = self.lock();
        if !peers.contains_key(&key) {
            // Same LAN node on the same host under a new chat port: move the entry, don't duplicate it.
            if let Some(old_key) = moved_from(&peers, &peer) {
                if let Some(old) = peers.remove(&old_key) {
                    tracing::debug!("Peer {} moved {} -> {}", old.node_id, old_key, key);
                    let mut moved = old.clone();
                    moved.port = peer.port;
                    moved.name = peer.name;
                    moved.last_seen = peer.last_seen.or(moved.last_seen);
                    peers.insert(key, moved);
                    return Upsert::Moved(old);
                }
            }
            peers.insert(key, peer);
            return Upsert::Changed;
        }
        let Some(existing) = peers.get_mut(&key) else {
            return Upsert::Unchanged;
        };

        let mut changed = false;
        let name = peer.name.trim();
        if !name.is_empty() && existing.name != name {
            existing.name = name.to_string();
            changed = true;
        }
        if !peer.node_id.is_empty() && existing.node_id != peer.node_id {
            existing.node_id = peer.node_id;
            changed = true;
        }
        // Manual is sticky: a user-added peer that also shows up on the LAN stays exempt from GC.
        if peer.source == PeerSource::Manual {
            existing.source = PeerSource::Manual;
        }
        existing.last_seen = match (existing.last_seen, peer.last_seen) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        if changed {
            Upsert::Changed
        } else {
            Upsert::Unchanged
        }
    }

    pub fn remove(&self, key: &str) -> Option<Peer> {
        self.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Peer> {
        self.lock().get(key).cloned()
    }

    /// Copy of the table, usable without holding the lock.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes LAN peers whose `last_seen` is more than `timeout` before `now`.
    /// Manual peers are never touched.
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let mut peers = self.lock();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.source == PeerSource::Lan)
            .filter(|(_, p)| match p.last_seen {
                Some(seen) => now.saturating_duration_since(seen) > timeout,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();

        stale.iter().filter_map(|key| peers.remove(key)).collect()
    }
}

fn moved_from(peers: &HashMap<String, Peer>, peer: &Peer) -> Option<String> {
    if peer.source != PeerSource::Lan || peer.node_id.is_empty() {
        return None;
    }
    peers
        .iter()
        .find(|(_, p)| {
            p.source == PeerSource::Lan && p.node_id == peer.node_id && p.host == peer.host
        })
        .map(|(key, _)| key.clone())
}

/// GC worker: drops quiet LAN peers and reports each one as `PeerDown`.
pub async fn run_gc(peers: PeerTable, events: EventSender, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now().into_std();
                for peer in peers.evict_stale(now, PEER_TIMEOUT) {
                    tracing::info!("Peer {} ({}) timed out", peer.name, peer.key());
                    events.send(Event::PeerDown(peer));
                }
            }
        }
    }
    tracing::debug!("GC loop stopped");
}
