use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::{Result, WireItem};

/// The primitive operations a single cache server exposes.
///
/// A backend owns its connection to exactly one endpoint and enforces its
/// own per-call timeout. Outcomes are reported with the memcached error
/// vocabulary: a missing key is [`CacheError::CacheMiss`], a failed `add`
/// is [`CacheError::NotStored`], and so on.
///
/// [`CacheError::CacheMiss`]: crate::protocol::CacheError::CacheMiss
/// [`CacheError::NotStored`]: crate::protocol::CacheError::NotStored
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetches the raw item stored under `key`.
    async fn get(&self, key: &str) -> Result<WireItem>;

    /// Stores `item` unconditionally.
    async fn set(&self, item: &WireItem) -> Result<()>;

    /// Stores `item` only if its key is not already present.
    async fn add(&self, item: &WireItem) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Updates the exptime of `key` (memcached exptime convention).
    async fn touch(&self, key: &str, seconds: i32) -> Result<()>;
}

/// Creates backends for endpoints handed out by discovery.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str, timeout: Duration) -> Arc<dyn Backend>;
}
