use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{Backend, Connector};
use crate::protocol::error::{CacheError, Result};
use crate::protocol::{WireItem, MAX_RELATIVE_EXPIRATION};
use crate::transport::codec::validate_key;

struct StoredValue {
    value: Vec<u8>,
    flags: u32,
    expires_at: Option<SystemTime>,
}

impl StoredValue {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Per-operation call counters, mostly useful in tests.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get: AtomicUsize,
    pub set: AtomicUsize,
    pub add: AtomicUsize,
    pub delete: AtomicUsize,
    pub touch: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.get.load(Ordering::SeqCst)
            + self.set.load(Ordering::SeqCst)
            + self.add.load(Ordering::SeqCst)
            + self.delete.load(Ordering::SeqCst)
            + self.touch.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.get.store(0, Ordering::SeqCst);
        self.set.store(0, Ordering::SeqCst);
        self.add.store(0, Ordering::SeqCst);
        self.delete.store(0, Ordering::SeqCst);
        self.touch.store(0, Ordering::SeqCst);
    }
}

/// In-memory memcached lookalike.
///
/// Honors memcached exptime semantics and can be switched "down" to
/// simulate an unreachable server; while down every call fails with a
/// connection error. A response delay makes it answer after its peers.
/// Backs the test server and the unit tests.
pub struct MemoryBackend {
    data: RwLock<HashMap<String, StoredValue>>,
    available: AtomicBool,
    delay_ms: AtomicU64,
    calls: CallCounts,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            calls: CallCounts::default(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delays every counted call by `delay` before it is served.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = SystemTime::now();
        self.data.read().await.values().filter(|v| v.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reads a key without counting the call or checking availability.
    pub async fn peek(&self, key: &str) -> Option<WireItem> {
        let now = SystemTime::now();
        let data = self.data.read().await;
        data.get(key).filter(|v| v.is_live(now)).map(|v| WireItem {
            key: key.to_string(),
            value: v.value.clone(),
            flags: v.flags,
            expiration: 0,
        })
    }

    /// Writes a key directly, bypassing counters and availability.
    pub async fn insert(&self, item: WireItem) {
        let expires_at = expires_at(i64::from(item.expiration), SystemTime::now());
        self.data.write().await.insert(
            item.key,
            StoredValue {
                value: item.value,
                flags: item.flags,
                expires_at,
            },
        );
    }

    async fn check(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::Connection("backend unavailable".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<WireItem> {
        self.check(&self.calls.get).await?;
        validate_key(key)?;
        self.peek(key).await.ok_or(CacheError::CacheMiss)
    }

    async fn set(&self, item: &WireItem) -> Result<()> {
        self.check(&self.calls.set).await?;
        validate_key(&item.key)?;
        self.insert(item.clone()).await;
        Ok(())
    }

    async fn add(&self, item: &WireItem) -> Result<()> {
        self.check(&self.calls.add).await?;
        validate_key(&item.key)?;

        let now = SystemTime::now();
        let mut data = self.data.write().await;
        if data.get(&item.key).is_some_and(|v| v.is_live(now)) {
            return Err(CacheError::NotStored);
        }
        data.insert(
            item.key.clone(),
            StoredValue {
                value: item.value.clone(),
                flags: item.flags,
                expires_at: expires_at(i64::from(item.expiration), now),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(&self.calls.delete).await?;
        validate_key(key)?;

        let now = SystemTime::now();
        match self.data.write().await.remove(key) {
            Some(v) if v.is_live(now) => Ok(()),
            _ => Err(CacheError::CacheMiss),
        }
    }

    async fn touch(&self, key: &str, seconds: i32) -> Result<()> {
        self.check(&self.calls.touch).await?;
        validate_key(key)?;

        let now = SystemTime::now();
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(v) if v.is_live(now) => {
                v.expires_at = expires_at(i64::from(seconds), now);
                Ok(())
            }
            _ => Err(CacheError::CacheMiss),
        }
    }
}

/// Converts a memcached exptime into an absolute expiry.
///
/// Negative values expire immediately, `0` never expires, small values are
/// relative and anything beyond 30 days is an absolute unix timestamp.
fn expires_at(exptime: i64, now: SystemTime) -> Option<SystemTime> {
    if exptime == 0 {
        None
    } else if exptime < 0 {
        Some(now)
    } else if exptime <= i64::from(MAX_RELATIVE_EXPIRATION) {
        Some(now + Duration::from_secs(exptime as u64))
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(exptime as u64))
    }
}

/// Hands out one shared [`MemoryBackend`] per endpoint.
///
/// Connecting to the same endpoint twice yields the same backend, so tests
/// can reach into a node's storage through [`MemoryConnector::backend`].
#[derive(Default)]
pub struct MemoryConnector {
    backends: std::sync::Mutex<HashMap<String, Arc<MemoryBackend>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the backend for `endpoint`, creating it if needed.
    pub fn backend(&self, endpoint: &str) -> Arc<MemoryBackend> {
        let mut backends = match self.backends.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backends
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(MemoryBackend::new()))
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &str, _timeout: Duration) -> Arc<dyn Backend> {
        self.backend(endpoint)
    }
}
