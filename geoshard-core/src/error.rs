use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoShardError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No shard available: {0}")]
    NoShardAvailable(String),

    #[error("Peer unreachable: {addr} ({reason})")]
    PeerUnreachable { addr: String, reason: String },

    #[error("Reconciliation inconclusive: {responded} of {required} peers responded")]
    ReconciliationInconclusive { responded: usize, required: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GeoShardError {
    pub fn peer_unreachable(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::PeerUnreachable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GeoShardError>;
