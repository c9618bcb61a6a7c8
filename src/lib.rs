pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod peer;
pub mod ports;
pub mod protocol;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod transport;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{ChatMessage, Event, EventQueue, EventSender};
pub use identity::NodeId;
pub use peer::{ManualPeer, Peer, PeerSource};
pub use state::{PeerTable, Upsert};
pub use storage::{JsonFilePeerStore, ManualPeerStore};

use config::STOP_GRACE;
use discovery::{DiscoveryContext, SelfAddrs};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{ChatClient, ChatInbox};

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// LAN discovery plus chat. One per process; each instance owns its own peer table,
/// so several can coexist (e.g. in tests).
pub struct SocialEngine {
    config: EngineConfig,
    node_id: NodeId,
    peers: PeerTable,
    events_tx: EventSender,
    events: EventQueue,
    local: SelfAddrs,
    // 0 = no chat server
    chat_port: AtomicU16,
    active: AtomicBool,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl SocialEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events_tx, events) = EventQueue::channel();
        Self {
            config,
            node_id: NodeId::generate(),
            peers: PeerTable::new(),
            events_tx,
            events,
            local: SelfAddrs::default(),
            chat_port: AtomicU16::new(0),
            active: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// None before `start` and when no chat port could be bound.
    pub fn chat_port(&self) -> Option<u16> {
        match self.chat_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.peers
    }

    /// Snapshot of known peers, sorted by name then endpoint.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers = self.peers.snapshot();
        peers.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.key().cmp(&b.key()))
        });
        peers
    }

    /// Binds sockets and spawns the workers. Bind failures degrade the affected
    /// subsystem and are reported as `Status` events; they never fail the call.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let cfg = &self.config;
        let listener = match ports::allocate_port(cfg.bind_ip, cfg.chat_port_base, cfg.chat_port_span).await {
            Ok((port, listener)) => {
                self.chat_port.store(port, Ordering::SeqCst);
                Some(listener)
            }
            Err(e) => {
                tracing::warn!("Chat server disabled: {}", e);
                self.events_tx
                    .status(format!("Chat disabled: {}; you can still send", e));
                self.chat_port.store(0, Ordering::SeqCst);
                None
            }
        };
        let chat_port = self.chat_port.load(Ordering::SeqCst);

        let discovery = Arc::new(DiscoveryContext {
            node_id: self.node_id.clone(),
            name: cfg.display_name.clone(),
            chat_port,
            bind_ip: cfg.bind_ip,
            discovery_port: cfg.discovery_port,
            peers: self.peers.clone(),
            events: self.events_tx.clone(),
            local: self.local.clone(),
        });
        // Listener first, so replies to our first probe have somewhere to land.
        tasks.push(tokio::spawn(discovery::run_listener(discovery.clone(), cancel.clone())));
        tasks.push(tokio::spawn(discovery::run_broadcaster(discovery, cancel.clone())));

        if let Some(listener) = listener {
            let inbox = Arc::new(ChatInbox {
                node_id: self.node_id.clone(),
                peers: self.peers.clone(),
                events: self.events_tx.clone(),
            });
            tasks.push(tokio::spawn(transport::run_chat_server(listener, inbox, cancel.clone())));
        }

        tasks.push(tokio::spawn(state::run_gc(
            self.peers.clone(),
            self.events_tx.clone(),
            cancel.clone(),
        )));

        tracing::info!(
            "Social engine started as '{}' (node {}), chat port {}, discovery port {}",
            cfg.display_name,
            self.node_id,
            chat_port,
            cfg.discovery_port
        );
        self.events_tx.status(format!(
            "Online as {} (chat port {})",
            cfg.display_name,
            self.chat_port()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string())
        ));

        *running = Some(Running { cancel, tasks });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops every worker, waiting at most `STOP_GRACE` before aborting stragglers.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.active.store(false, Ordering::SeqCst);
        running.cancel.cancel();

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for mut task in running.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Worker did not stop in time; aborting");
                task.abort();
            }
        }
        self.chat_port.store(0, Ordering::SeqCst);
        tracing::info!("Social engine stopped");
    }

    fn client(&self) -> ChatClient {
        ChatClient {
            node_id: self.node_id.clone(),
            name: self.config.display_name.clone(),
            reply_port: self.chat_port.load(Ordering::SeqCst),
        }
    }

    /// Sends one message to exactly `host:port`.
    pub async fn send_chat(&self, host: &str, port: u16, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.client().send_chat(host, port, text).await
    }

    /// Sends to `selected`, falling back through related endpoints if its address has
    /// drifted. Returns the peer that accepted the message; callers should switch
    /// their selection to it.
    pub async fn send_to_peer(&self, selected: &Peer, text: &str) -> Result<Peer> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let candidates = resolver::resolve(selected, &self.peers.snapshot());
        tracing::debug!(
            "Sending to {} via {:?}",
            selected.key(),
            candidates.iter().map(|c| (c.rank, c.peer.key())).collect::<Vec<_>>()
        );
        self.client().deliver(&candidates, text).await
    }

    pub fn add_manual_peer(&self, manual: ManualPeer) -> bool {
        let peer = manual.into_peer();
        let changed = self.peers.upsert(peer.clone()).notify(&peer, &self.events_tx);
        if changed {
            tracing::info!("Added manual peer {} at {}", peer.name, peer.key());
        }
        changed
    }

    pub fn remove_peer(&self, key: &str) -> Option<Peer> {
        let removed = self.peers.remove(key)?;
        self.events_tx.send(Event::PeerDown(removed.clone()));
        Some(removed)
    }

    pub fn manual_peers(&self) -> Vec<ManualPeer> {
        self.peers()
            .iter()
            .filter(|p| p.source == PeerSource::Manual)
            .map(ManualPeer::from)
            .collect()
    }

    pub fn load_manual_peers(&self, store: &dyn ManualPeerStore) -> Result<usize> {
        let loaded = store.load()?;
        let count = loaded.len();
        for manual in loaded {
            self.add_manual_peer(manual);
        }
        Ok(count)
    }

    pub fn save_manual_peers(&self, store: &dyn ManualPeerStore) -> Result<()> {
        store.save(&self.manual_peers())
    }
}

impl Drop for SocialEngine {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}
