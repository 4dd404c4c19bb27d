use std::time::Duration;

use async_trait::async_trait;
use cacheha_common::transport::{MemcacheBackend, MemcacheCodec};
use cacheha_common::{CacheError, Result};
use tracing::debug;

/// Default timeout for a cluster config lookup.
const CLUSTER_CONFIG_TIMEOUT: Duration = Duration::from_secs(1);

/// A source of cache endpoints.
///
/// Sources are polled by the scheduler on every discovery pass. The
/// returned list need not be sorted or deduplicated.
///
/// ```
/// use async_trait::async_trait;
/// use cacheha_client::NodeSource;
/// use cacheha_common::Result;
///
/// struct FromEnv;
///
/// #[async_trait]
/// impl NodeSource for FromEnv {
///     async fn get_nodes(&self) -> Result<Vec<String>> {
///         Ok(std::env::var("CACHE_NODES")
///             .unwrap_or_default()
///             .split(',')
///             .filter(|s| !s.is_empty())
///             .map(str::to_string)
///             .collect())
///     }
/// }
/// ```
#[async_trait]
pub trait NodeSource: Send + Sync + 'static {
    async fn get_nodes(&self) -> Result<Vec<String>>;
}

/// A fixed list of endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeSource {
    endpoints: Vec<String>,
}

impl StaticNodeSource {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl NodeSource for StaticNodeSource {
    async fn get_nodes(&self) -> Result<Vec<String>> {
        Ok(self.endpoints.clone())
    }
}

/// Resolves a `host:port` name and yields one endpoint per address.
///
/// Useful with DNS names that publish one record per cache server.
#[derive(Debug, Clone)]
pub struct DnsNodeSource {
    name: String,
}

impl DnsNodeSource {
    /// # Arguments
    /// * `name` - Name to resolve, including the port (e.g., "cache.internal:11211")
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NodeSource for DnsNodeSource {
    async fn get_nodes(&self) -> Result<Vec<String>> {
        let addrs = tokio::net::lookup_host(self.name.as_str())
            .await
            .map_err(|e| CacheError::Discovery(format!("Failed to resolve {}: {}", self.name, e)))?;

        let endpoints: Vec<String> = addrs.map(|addr| addr.to_string()).collect();
        debug!("Resolved {} to {} endpoints", self.name, endpoints.len());
        Ok(endpoints)
    }
}

/// Memcached cluster auto-discovery.
///
/// Asks a configuration endpoint for its `cluster` config (`config get
/// cluster`) and returns the members it lists. Managed memcached services
/// expose this on their configuration endpoint.
pub struct ClusterConfigNodeSource {
    backend: MemcacheBackend,
}

impl ClusterConfigNodeSource {
    pub fn new(config_endpoint: impl Into<String>) -> Self {
        Self::with_timeout(config_endpoint, CLUSTER_CONFIG_TIMEOUT)
    }

    pub fn with_timeout(config_endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend: MemcacheBackend::new(config_endpoint, timeout),
        }
    }

    pub fn config_endpoint(&self) -> &str {
        self.backend.endpoint()
    }
}

#[async_trait]
impl NodeSource for ClusterConfigNodeSource {
    async fn get_nodes(&self) -> Result<Vec<String>> {
        let endpoint = self.backend.endpoint();
        let data = self.backend.config_get("cluster").await.map_err(|e| match e {
            CacheError::CacheMiss => CacheError::Discovery(format!("{} has no cluster config", endpoint)),
            other => CacheError::Discovery(format!("Failed to read cluster config from {}: {}", endpoint, other)),
        })?;

        MemcacheCodec::decode_cluster_config(&data)
            .map_err(|e| CacheError::Discovery(format!("Bad cluster config from {}: {}", endpoint, e)))
    }
}
