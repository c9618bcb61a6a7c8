use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSource {
    /// Learned from discovery or an inbound chat; expires when it goes quiet.
    #[serde(rename = "LAN")]
    Lan,
    /// Entered by the user; never expires.
    #[serde(rename = "manual")]
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub source: PeerSource,
    pub node_id: String,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Peer {
    pub fn lan(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        node_id: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let mut name = name.into().trim().to_string();
        if name.is_empty() {
            name = host.clone();
        }
        Self {
            name,
            host,
            port,
            source: PeerSource::Lan,
            node_id: node_id.into(),
            last_seen: Some(Instant::now()),
        }
    }

    /// Table key. One entry per `host:port`.
    pub fn key(&self) -> String {
        peer_key(&self.host, self.port)
    }

    pub fn is_lan(&self) -> bool {
        self.source == PeerSource::Lan
    }

    pub fn same_endpoint(&self, other: &Peer) -> bool {
        self.host == other.host && self.port == other.port
    }
}

pub fn peer_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// A user-entered peer as persisted by a `ManualPeerStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPeer {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ManualPeer {
    pub fn into_peer(self) -> Peer {
        Peer {
            name: self.name,
            host: self.host,
            port: self.port,
            source: PeerSource::Manual,
            node_id: String::new(),
            last_seen: None,
        }
    }
}

impl From<&Peer> for ManualPeer {
    fn from(peer: &Peer) -> Self {
        Self {
            name: peer.name.clone(),
            host: peer.host.clone(),
            port: peer.port,
        }
    }
}

impl FromStr for ManualPeer {
    type Err = EngineError;

    /// Accepts `alias@host:port` or `host:port`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidPeer(input.to_string());
        let raw = input.trim();

        let (alias, endpoint) = match raw.split_once('@') {
            Some((alias, endpoint)) => (alias.trim(), endpoint.trim()),
            None => ("", raw),
        };
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains('@') {
            return Err(invalid());
        }
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        let name = if alias.is_empty() { host } else { alias };
        Ok(ManualPeer {
            name: name.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ManualPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}
