use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Body shared by `announce` and `probe`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Presence {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    /// 0 means the sender has no chat server (degraded mode).
    #[serde(default)]
    pub chat_port: u16,
    #[serde(default)]
    pub reply_port: u16,
    #[serde(default)]
    pub ts: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub from: String,
    pub text: String,
    #[serde(default)]
    pub ts: f64,
    #[serde(default)]
    pub reply_port: u16,
}

/// Everything that goes over the wire, told apart by the `type` field.
/// `announce`/`probe` travel as UDP datagrams; `chat` as one line per TCP connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    Announce(Presence),
    Probe(Presence),
    Chat(ChatPayload),
}

impl Packet {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// None for anything that isn't one of our packets. Unknown types are not errors.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Seconds since the epoch, as a float.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
