use serde::{Deserialize, Serialize};
use std::fmt;

/// Random per-process node id. Never persisted, so a restarted process is a new node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub const LEN: usize = 12;

    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(Self::LEN);
        NodeId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `other` names this node. Empty ids never match.
    pub fn is(&self, other: &str) -> bool {
        !other.is_empty() && self.0 == other
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
