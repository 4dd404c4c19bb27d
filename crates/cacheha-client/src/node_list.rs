use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cacheha_common::Result;
use tokio::sync::RwLock;
use tracing::info;

use crate::node::{Node, NodeStatus};

/// Registry of every node the client knows about, keyed by endpoint.
///
/// All accessors hand out copies, so callers never hold the registry lock
/// while talking to a backend.
#[derive(Default)]
pub struct NodeList {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the nodes currently marked healthy.
    pub async fn healthy_nodes(&self) -> HashMap<String, Arc<Node>> {
        let nodes = self.all_nodes().await;
        let mut healthy = HashMap::with_capacity(nodes.len());
        for (endpoint, node) in nodes {
            if node.is_healthy().await {
                healthy.insert(endpoint, node);
            }
        }
        healthy
    }

    pub async fn healthy_count(&self) -> usize {
        self.healthy_nodes().await.len()
    }

    /// Snapshot of every registered node.
    pub async fn all_nodes(&self) -> HashMap<String, Arc<Node>> {
        self.nodes.read().await.clone()
    }

    pub async fn exists(&self, endpoint: &str) -> bool {
        self.nodes.read().await.contains_key(endpoint)
    }

    /// Registers `node`.
    ///
    /// # Returns
    /// `false` if a node with the same endpoint is already registered; the
    /// existing node is kept.
    pub async fn add(&self, node: Arc<Node>) -> bool {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(node.endpoint()) {
            return false;
        }
        info!("Node {} added", node.endpoint());
        nodes.insert(node.endpoint().to_string(), node);
        true
    }

    /// Unregisters the node for `endpoint`, returning whether it existed.
    pub async fn remove(&self, endpoint: &str) -> bool {
        let removed = self.nodes.write().await.remove(endpoint).is_some();
        if removed {
            info!("Node {} removed", endpoint);
        }
        removed
    }

    /// Drops every node whose endpoint is not in `current`.
    ///
    /// # Returns
    /// The removed endpoints.
    pub async fn remove_except(&self, current: &HashSet<String>) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let stale: Vec<String> = nodes.keys().filter(|endpoint| !current.contains(*endpoint)).cloned().collect();
        for endpoint in &stale {
            nodes.remove(endpoint);
            info!("Node {} removed", endpoint);
        }
        stale
    }

    /// Probes every node concurrently.
    ///
    /// Health flags are updated by the probes themselves. The first hard
    /// probe error, if any, is returned after all probes complete.
    pub async fn health_check(&self) -> Result<()> {
        let nodes = self.all_nodes().await;

        let checks: Vec<_> = nodes.values().map(|node| node.health_check()).collect();
        let results = futures::future::join_all(checks).await;

        for result in results {
            result?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Health of every node, sorted by endpoint.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let nodes = self.all_nodes().await;
        let mut statuses = Vec::with_capacity(nodes.len());
        for node in nodes.values() {
            statuses.push(node.status().await);
        }
        statuses.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cacheha_common::transport::{MemoryBackend, MemoryConnector};
    use cacheha_common::Connector;
    use std::time::Duration;

    fn node(connector: &MemoryConnector, endpoint: &str) -> Arc<Node> {
        Arc::new(Node::new(endpoint, connector.connect(endpoint, Duration::from_millis(100))))
    }

    fn set(endpoints: &[&str]) -> HashSet<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let connector = MemoryConnector::new();
        let list = NodeList::new();

        assert!(list.add(node(&connector, "a")).await);
        assert!(!list.add(node(&connector, "a")).await);
        assert_eq!(list.len().await, 1);
        assert!(list.exists("a").await);
        assert!(!list.exists("b").await);
    }

    #[tokio::test]
    async fn test_remove_except() {
        let connector = MemoryConnector::new();
        let list = NodeList::new();
        for endpoint in ["a", "b", "c"] {
            list.add(node(&connector, endpoint)).await;
        }

        let mut removed = list.remove_except(&set(&["b", "c", "d"])).await;
        removed.sort();
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(list.len().await, 2);
        assert!(!list.exists("a").await);
        // remove_except never adds
        assert!(!list.exists("d").await);
    }

    #[tokio::test]
    async fn test_remove() {
        let connector = MemoryConnector::new();
        let list = NodeList::new();
        list.add(node(&connector, "a")).await;

        assert!(list.remove("a").await);
        assert!(!list.remove("a").await);
        assert!(list.is_empty().await);
    }

    #[tokio::test]
    async fn test_healthy_snapshot_excludes_failed_nodes() {
        let connector = MemoryConnector::new();
        let list = NodeList::new();
        for endpoint in ["a", "b", "c"] {
            list.add(node(&connector, endpoint)).await;
        }

        connector.backend("b").set_available(false);
        list.health_check().await.unwrap();

        let healthy = list.healthy_nodes().await;
        assert_eq!(healthy.len(), 2);
        assert!(!healthy.contains_key("b"));
        assert_eq!(list.healthy_count().await, 2);

        connector.backend("b").set_available(true);
        list.health_check().await.unwrap();
        assert_eq!(list.healthy_count().await, 3);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let connector = MemoryConnector::new();
        let list = NodeList::new();
        list.add(node(&connector, "a")).await;

        let snapshot = list.all_nodes().await;
        list.remove("a").await;
        assert!(snapshot.contains_key("a"));
    }

    #[tokio::test]
    async fn test_statuses_sorted() {
        let list = NodeList::new();
        for endpoint in ["c", "a", "b"] {
            list.add(Arc::new(Node::new(endpoint, Arc::new(MemoryBackend::new())))).await;
        }

        let endpoints: Vec<String> = list.statuses().await.into_iter().map(|s| s.endpoint).collect();
        assert_eq!(endpoints, vec!["a", "b", "c"]);
    }
}
