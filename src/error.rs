pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to bind {what}: {source}")]
    Bind {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free chat port in {span} ports starting at {base}")]
    PortExhausted { base: u16, span: u16 },

    #[error("invalid peer '{0}' (use alias@host:port or host:port)")]
    InvalidPeer(String),

    #[error("timed out talking to {addr}")]
    Timeout { addr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Every candidate endpoint was tried and none accepted the message.
    #[error("chat not delivered after {attempts} attempt(s): {last}")]
    ChatDelivery {
        attempts: usize,
        last: Box<EngineError>,
    },

    #[error("engine is not running")]
    NotRunning,
}

impl EngineError {
    pub(crate) fn bind(what: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Bind {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn timeout(addr: impl ToString) -> Self {
        EngineError::Timeout {
            addr: addr.to_string(),
        }
    }
}
