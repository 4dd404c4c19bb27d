use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use cacheha_common::backend::Backend;
use cacheha_common::{CacheError, CacheItem, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Length in bytes of the random key read by a health probe.
const PROBE_KEY_BYTES: usize = 32;

/// The outcome of one operation on one node.
#[derive(Debug)]
pub struct NodeResponse {
    pub node: Arc<Node>,
    /// `Ok(Some(item))` for a successful read, `Ok(None)` for any other success.
    pub result: Result<Option<CacheItem>>,
}

/// Where a node reports the outcome of a dispatched operation.
pub type ResponseSender = mpsc::UnboundedSender<NodeResponse>;

/// A single operation a node can run against its backend.
#[derive(Debug, Clone)]
pub enum Operation {
    Add(CacheItem),
    Set(CacheItem),
    Get(String),
    Delete(String),
    Touch(String, i32),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Add(_) => "add",
            Operation::Set(_) => "set",
            Operation::Get(_) => "get",
            Operation::Delete(_) => "delete",
            Operation::Touch(..) => "touch",
        }
    }
}

/// Point-in-time view of a node's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub endpoint: String,
    pub healthy: bool,
    pub last_health_check: Option<SystemTime>,
}

#[derive(Debug)]
struct HealthState {
    healthy: bool,
    last_health_check: Option<SystemTime>,
}

/// One cache server as seen by the client.
///
/// A node owns the backend for its endpoint and tracks whether that backend
/// is currently usable. The flag only ever reflects the most recent call:
/// a timeout or connection failure marks the node unhealthy straight away,
/// and the next call that gets an answer (a miss counts) marks it healthy.
pub struct Node {
    endpoint: String,
    backend: Arc<dyn Backend>,
    health: RwLock<HealthState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("endpoint", &self.endpoint).finish_non_exhaustive()
    }
}

impl Node {
    /// Creates a node in the healthy state.
    ///
    /// # Arguments
    /// * `endpoint` - The endpoint this node represents (e.g., "10.0.0.1:11211")
    /// * `backend` - The backend connected to that endpoint
    pub fn new(endpoint: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            endpoint: endpoint.into(),
            backend,
            health: RwLock::new(HealthState {
                healthy: true,
                last_health_check: None,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn is_healthy(&self) -> bool {
        self.health.read().await.healthy
    }

    pub async fn last_health_check(&self) -> Option<SystemTime> {
        self.health.read().await.last_health_check
    }

    pub async fn status(&self) -> NodeStatus {
        let health = self.health.read().await;
        NodeStatus {
            endpoint: self.endpoint.clone(),
            healthy: health.healthy,
            last_health_check: health.last_health_check,
        }
    }

    /// Runs `op` on its own task and reports the outcome on `sink`.
    ///
    /// With no sink the operation is fire-and-forget.
    pub fn dispatch(self: &Arc<Self>, op: Operation, sink: Option<ResponseSender>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.execute(op).await;
            if let Some(sink) = sink {
                // the aggregator may have given up already
                let _ = sink.send(NodeResponse { node, result });
            }
        });
    }

    pub fn add(self: &Arc<Self>, item: CacheItem, sink: Option<ResponseSender>) {
        self.dispatch(Operation::Add(item), sink);
    }

    pub fn set(self: &Arc<Self>, item: CacheItem, sink: Option<ResponseSender>) {
        self.dispatch(Operation::Set(item), sink);
    }

    pub fn get(self: &Arc<Self>, key: impl Into<String>, sink: Option<ResponseSender>) {
        self.dispatch(Operation::Get(key.into()), sink);
    }

    pub fn delete(self: &Arc<Self>, key: impl Into<String>, sink: Option<ResponseSender>) {
        self.dispatch(Operation::Delete(key.into()), sink);
    }

    pub fn touch(self: &Arc<Self>, key: impl Into<String>, seconds: i32, sink: Option<ResponseSender>) {
        self.dispatch(Operation::Touch(key.into(), seconds), sink);
    }

    /// Runs `op` inline, classifying the outcome.
    pub async fn execute(&self, op: Operation) -> Result<Option<CacheItem>> {
        debug!("Node {}: {}", self.endpoint, op.name());

        match op {
            Operation::Add(item) | Operation::Set(item) if item.is_expired() => {
                // the item would be dead on arrival
                debug!("Node {}: skipping store of expired key {}", self.endpoint, item.key);
                Ok(None)
            }
            Operation::Add(item) => {
                let result = self.backend.add(&item.to_wire()).await;
                self.classify(result).await.map(|_| None)
            }
            Operation::Set(item) => {
                let result = self.backend.set(&item.to_wire()).await;
                self.classify(result).await.map(|_| None)
            }
            Operation::Get(key) => {
                let result = self.backend.get(&key).await;
                let wire = self.classify(result).await?;
                CacheItem::from_wire(wire).map(Some)
            }
            Operation::Delete(key) => {
                let result = self.backend.delete(&key).await;
                self.classify(result).await.map(|_| None)
            }
            Operation::Touch(key, seconds) => {
                let result = self.backend.touch(&key, seconds).await;
                self.classify(result).await.map(|_| None)
            }
        }
    }

    /// Probes the backend by reading a random key.
    ///
    /// # Returns
    /// The node's health after the probe.
    ///
    /// # Errors
    /// Returns [`CacheError::HealthCheck`] if no probe key could be generated;
    /// health is left untouched in that case.
    pub async fn health_check(&self) -> Result<bool> {
        let key = probe_key()?;
        let result = self.backend.get(&key).await;
        let _ = self.classify(result).await;
        Ok(self.is_healthy().await)
    }

    /// Updates health from the outcome of a backend call and passes it on.
    async fn classify<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.record(true, None).await,
            Err(e) if e.is_reachable() => self.record(true, None).await,
            Err(e) => self.record(false, Some(e)).await,
        }
        result
    }

    async fn record(&self, healthy: bool, err: Option<&CacheError>) {
        let mut health = self.health.write().await;
        health.last_health_check = Some(SystemTime::now());

        if health.healthy == healthy {
            return;
        }
        health.healthy = healthy;

        if healthy {
            info!("Node {} is healthy again", self.endpoint);
        } else {
            match err {
                Some(e) => warn!("Node {} marked unhealthy: {}", self.endpoint, e),
                None => warn!("Node {} marked unhealthy", self.endpoint),
            }
        }
    }
}

/// Hex encoded random key, long enough that it is never actually stored.
fn probe_key() -> Result<String> {
    let mut bytes = [0u8; PROBE_KEY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CacheError::HealthCheck(format!("Failed to generate probe key: {}", e)))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
