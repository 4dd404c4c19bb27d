use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cacheha: no healthy nodes")]
    NoHealthyNodes,

    #[error("cacheha: item not stored")]
    NotStored,

    #[error("cacheha: cache miss")]
    CacheMiss,

    #[error("cacheha: compare-and-swap conflict")]
    CasConflict,

    #[error("cacheha: malformed key")]
    MalformedKey,

    #[error("cacheha: no statistics available")]
    NoStats,

    #[error("cacheha: not a cacheha item")]
    NotCacheHaItem,

    #[error("cacheha: already running")]
    AlreadyRunning,

    #[error("cacheha: not running")]
    NotRunning,

    #[error("cacheha: unknown error occurred")]
    Unknown,

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Health check error: {0}")]
    HealthCheck(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Returns `true` for outcomes that prove the backend answered and is
    /// behaving, even though the operation itself did not succeed.
    ///
    /// Everything else (timeouts, connection loss, protocol garbage) means the
    /// backend should be treated as unavailable.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            CacheError::CacheMiss
                | CacheError::NotStored
                | CacheError::CasConflict
                | CacheError::MalformedKey
                | CacheError::NoStats
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
