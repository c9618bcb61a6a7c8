use crate::error::Result;
use crate::peer::ManualPeer;
use std::fs;
use std::path::{Path, PathBuf};

/// Where user-entered peers live between runs. The engine only ever sees the records.
pub trait ManualPeerStore {
    fn load(&self) -> Result<Vec<ManualPeer>>;
    fn save(&self, peers: &[ManualPeer]) -> Result<()>;
}

/// Stores manual peers as a pretty-printed JSON array.
pub struct JsonFilePeerStore {
    path: PathBuf,
}

impl JsonFilePeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/lan-social/manual_peers.json`, or the working directory if there is no config dir.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("lan-social"))
            .unwrap_or_default()
            .join("manual_peers.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManualPeerStore for JsonFilePeerStore {
    fn load(&self) -> Result<Vec<ManualPeer>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let peers: Vec<ManualPeer> = serde_json::from_str(&content)?;
        tracing::info!("Loaded {} manual peers from {}", peers.len(), self.path.display());
        // Hand-edited files can hold garbage; only keep records that would parse as input.
        Ok(peers
            .into_iter()
            .filter(|p| p.port > 0 && !p.host.trim().is_empty())
            .collect())
    }

    fn save(&self, peers: &[ManualPeer]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(peers)?;
        fs::write(&self.path, json)?;
        tracing::debug!("Saved {} manual peers to {}", peers.len(), self.path.display());
        Ok(())
    }
}
