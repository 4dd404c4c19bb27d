use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cacheha_common::backend::Connector;
use cacheha_common::transport::{validate_key, MemcacheConnector};
use cacheha_common::{CacheError, CacheItem, Result};
use rand::seq::SliceRandom;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::discovery::NodeSource;
use crate::node::{Node, NodeResponse, NodeStatus, Operation};
use crate::node_list::NodeList;
use crate::scheduler::{DiscoveryReport, Scheduler, SchedulerHandle};

/// How often [`Client::wait_for_healthy_node`] re-checks.
const HEALTHY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// High-availability cache client.
///
/// Writes fan out to every healthy node, reads go to a random majority, and
/// divergence found along the way is repaired in the background:
///
/// 1. **Set/Delete/Touch**: sent to all healthy nodes
/// 2. **Get**: sent to `ceil(n/2)` random healthy nodes when there are more
///    than two, otherwise to all; nodes that missed get the value written
///    back without delaying the caller
/// 3. **Add**: sent to all healthy nodes; if any node already held the key
///    the existing value is read back and copied over the nodes that
///    accepted the new one
///
/// Nodes that time out or drop the connection are left out of later calls
/// until a probe finds them reachable again.
///
/// # Lifecycle
///
/// A new client knows no nodes. [`start`](Client::start) launches the
/// background scheduler, which discovers nodes from the configured sources
/// and probes them; [`stop`](Client::stop) shuts it down.
pub struct Client {
    nodes: Arc<NodeList>,
    scheduler: Arc<Scheduler>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    running: Mutex<Option<SchedulerHandle>>,
}

impl Client {
    /// Creates a client over memcached servers with the default config.
    ///
    /// # Arguments
    /// * `sources` - Where to discover cache endpoints
    ///
    /// # Example
    /// ```no_run
    /// # use cacheha_client::{Client, StaticNodeSource};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::new(vec![Box::new(StaticNodeSource::new([
    ///     "10.0.0.1:11211",
    ///     "10.0.0.2:11211",
    /// ]))])?;
    /// client.start().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(sources: Vec<Box<dyn NodeSource>>) -> Result<Self> {
        Self::with_config(sources, ClientConfig::default())
    }

    /// Creates a client over memcached servers with a custom config.
    pub fn with_config(sources: Vec<Box<dyn NodeSource>>, config: ClientConfig) -> Result<Self> {
        Self::with_connector(sources, config, Arc::new(MemcacheConnector))
    }

    /// Creates a client whose nodes are built by `connector`.
    ///
    /// # Errors
    /// Returns [`CacheError::InvalidConfig`] if `config` does not validate.
    pub fn with_connector(
        sources: Vec<Box<dyn NodeSource>>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let nodes = Arc::new(NodeList::new());
        let scheduler = Arc::new(Scheduler::new(
            nodes.clone(),
            sources,
            connector.clone(),
            config.clone(),
        ));

        Ok(Self {
            nodes,
            scheduler,
            connector,
            config,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Launches the background scheduler.
    ///
    /// # Errors
    /// Returns [`CacheError::AlreadyRunning`] if it is already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CacheError::AlreadyRunning);
        }
        *running = Some(self.scheduler.spawn());
        info!("Client started");
        Ok(())
    }

    /// Stops the background scheduler and waits for it to exit.
    ///
    /// # Errors
    /// Returns [`CacheError::NotRunning`] if it is not running.
    pub async fn stop(&self) -> Result<()> {
        // held until the loop exits so a concurrent start cannot overlap it
        let mut running = self.running.lock().await;
        let handle = running.take().ok_or(CacheError::NotRunning)?;
        handle.stop().await?;
        info!("Client stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Waits until at least one node is healthy.
    ///
    /// # Errors
    /// Returns [`CacheError::NoHealthyNodes`] if `deadline` passes first.
    pub async fn wait_for_healthy_node(&self, deadline: Instant) -> Result<()> {
        loop {
            if self.nodes.healthy_count().await > 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::NoHealthyNodes);
            }
            tokio::time::sleep(HEALTHY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stores `item` only if its key is not present.
    ///
    /// # Errors
    /// - [`CacheError::NotStored`] if any node already held the key
    /// - [`CacheError::NoHealthyNodes`] if no node stored the item
    /// - [`CacheError::MalformedKey`] for keys memcached would reject
    pub async fn add(&self, item: CacheItem) -> Result<()> {
        let nodes = self.healthy_nodes().await?;
        validate_key(&item.key)?;

        let list = self.nodes.clone();
        guarded(async move {
            let key = item.key.clone();
            let mut rx = fan_out(nodes.values(), |_| Operation::Add(item.clone()));

            let mut stored = Vec::new();
            let mut not_stored = false;
            while let Some(response) = rx.recv().await {
                match response.result {
                    Ok(_) => stored.push(response.node),
                    Err(CacheError::NotStored) => not_stored = true,
                    Err(e) => debug!("Add of {} on node {} failed: {}", key, response.node.endpoint(), e),
                }
            }

            if not_stored {
                // someone else got there first; make their value win everywhere
                match read(list, key.clone()).await {
                    Ok(existing) => {
                        for node in &stored {
                            info!("Repairing key {} on node {} after lost add", key, node.endpoint());
                            node.set(existing.clone(), None);
                        }
                    }
                    Err(e) => debug!("Could not re-read {} after lost add: {}", key, e),
                }
                return Err(CacheError::NotStored);
            }

            if list.healthy_count().await == 0 || stored.is_empty() {
                return Err(CacheError::NoHealthyNodes);
            }
            Ok(())
        })
        .await
    }

    /// Stores `item` on every healthy node.
    pub async fn set(&self, item: CacheItem) -> Result<()> {
        let nodes = self.healthy_nodes().await?;
        validate_key(&item.key)?;

        let list = self.nodes.clone();
        guarded(async move {
            let mut rx = fan_out(nodes.values(), |_| Operation::Set(item.clone()));
            while rx.recv().await.is_some() {}

            if list.healthy_count().await == 0 {
                return Err(CacheError::NoHealthyNodes);
            }
            Ok(())
        })
        .await
    }

    /// Reads `key` from a random majority of healthy nodes.
    ///
    /// The first value returned wins. Nodes that reported a miss are
    /// repaired in the background.
    ///
    /// # Errors
    /// Returns [`CacheError::CacheMiss`] if no queried node had the key.
    pub async fn get(&self, key: &str) -> Result<CacheItem> {
        guarded(read(self.nodes.clone(), key.to_string())).await
    }

    /// Deletes `key` from every healthy node.
    ///
    /// # Errors
    /// Returns [`CacheError::CacheMiss`] if any node did not hold the key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let nodes = self.healthy_nodes().await?;
        validate_key(key)?;

        let key = key.to_string();
        self.fan_out_expecting_hit(nodes, move |_| Operation::Delete(key.clone())).await
    }

    /// Updates the expiry of `key` on every healthy node.
    ///
    /// `seconds` follows the memcached exptime convention. The expiry
    /// embedded in the stored value is not rewritten.
    ///
    /// # Errors
    /// Returns [`CacheError::CacheMiss`] if any node did not hold the key.
    pub async fn touch(&self, key: &str, seconds: i32) -> Result<()> {
        let nodes = self.healthy_nodes().await?;
        validate_key(key)?;

        let key = key.to_string();
        self.fan_out_expecting_hit(nodes, move |_| Operation::Touch(key.clone(), seconds)).await
    }

    async fn fan_out_expecting_hit<F>(&self, nodes: HashMap<String, Arc<Node>>, op: F) -> Result<()>
    where
        F: Fn(&Arc<Node>) -> Operation + Send + 'static,
    {
        let list = self.nodes.clone();
        guarded(async move {
            let mut rx = fan_out(nodes.values(), op);

            let mut missed = false;
            while let Some(response) = rx.recv().await {
                if matches!(response.result, Err(CacheError::CacheMiss)) {
                    missed = true;
                }
            }

            if list.healthy_count().await == 0 {
                return Err(CacheError::NoHealthyNodes);
            }
            if missed {
                return Err(CacheError::CacheMiss);
            }
            Ok(())
        })
        .await
    }

    async fn healthy_nodes(&self) -> Result<HashMap<String, Arc<Node>>> {
        let nodes = self.nodes.healthy_nodes().await;
        if nodes.is_empty() {
            return Err(CacheError::NoHealthyNodes);
        }
        Ok(nodes)
    }

    /// Registers a node by endpoint without waiting for discovery.
    ///
    /// # Returns
    /// `false` if the endpoint was already registered.
    pub async fn add_node(&self, endpoint: &str) -> bool {
        let backend = self.connector.connect(endpoint, self.config.node_timeout);
        self.nodes.add(Arc::new(Node::new(endpoint, backend))).await
    }

    /// Unregisters a node.
    ///
    /// Discovery adds it back if a source still reports it.
    pub async fn remove_node(&self, endpoint: &str) -> bool {
        self.nodes.remove(endpoint).await
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.len().await
    }

    pub async fn healthy_node_count(&self) -> usize {
        self.nodes.healthy_count().await
    }

    pub async fn nodes_with_status(&self) -> Vec<NodeStatus> {
        self.nodes.statuses().await
    }

    /// Runs a discovery pass now.
    pub async fn discover_nodes(&self) -> Result<DiscoveryReport> {
        self.scheduler.discover_nodes().await
    }

    /// Probes every node now.
    pub async fn health_check(&self) -> Result<()> {
        self.scheduler.health_check().await
    }

    /// Summary of membership and health.
    pub async fn get_info(&self) -> Result<serde_json::Value> {
        let statuses = self.nodes_with_status().await;
        let healthy = statuses.iter().filter(|s| s.healthy).count();

        Ok(json!({
            "running": self.is_running().await,
            "total_nodes": statuses.len(),
            "healthy_nodes": healthy,
            "unhealthy_nodes": statuses.len() - healthy,
            "nodes": serde_json::to_value(&statuses)?,
            "config": {
                "discovery_interval_ms": self.config.discovery_interval.as_millis() as u64,
                "health_check_interval_ms": self.config.health_check_interval.as_millis() as u64,
                "node_timeout_ms": self.config.node_timeout.as_millis() as u64,
            },
        }))
    }
}

/// The Get path, shared by [`Client::get`] and the lost-add re-read.
async fn read(list: Arc<NodeList>, key: String) -> Result<CacheItem> {
    let nodes = list.healthy_nodes().await;
    if nodes.is_empty() {
        return Err(CacheError::NoHealthyNodes);
    }
    validate_key(&key)?;

    let mut targets: Vec<Arc<Node>> = nodes.into_values().collect();
    if targets.len() > 2 {
        let quorum = (targets.len() + 1) / 2;
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(quorum);
    }

    let mut rx = fan_out(targets.iter(), |_| Operation::Get(key.clone()));

    let mut found: Option<CacheItem> = None;
    let mut missing = Vec::new();
    while let Some(response) = rx.recv().await {
        match response.result {
            Ok(Some(item)) if found.is_none() => found = Some(item),
            Ok(_) => {}
            Err(CacheError::CacheMiss) => missing.push(response.node),
            Err(e) => debug!("Get of {} on node {} failed: {}", key, response.node.endpoint(), e),
        }
    }

    let item = found.ok_or(CacheError::CacheMiss)?;
    for node in missing {
        info!("Repairing key {} on node {}", key, node.endpoint());
        node.set(item.clone(), None);
    }
    Ok(item)
}

/// Dispatches one operation per node, returning the channel the responses
/// arrive on. The channel closes once every node has reported.
fn fan_out<'a, I, F>(nodes: I, op: F) -> mpsc::UnboundedReceiver<NodeResponse>
where
    I: IntoIterator<Item = &'a Arc<Node>>,
    F: Fn(&Arc<Node>) -> Operation,
{
    let (tx, rx) = mpsc::unbounded_channel();
    for node in nodes {
        node.dispatch(op(node), Some(tx.clone()));
    }
    rx
}

/// Runs an aggregation on its own task so a panic surfaces as an error.
async fn guarded<T, F>(aggregate: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(aggregate).await {
        Ok(result) => result,
        Err(e) => {
            error!("Operation aggregation failed: {}", e);
            Err(CacheError::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cacheha_common::transport::{MemoryBackend, MemoryConnector};
    use cacheha_common::WireItem;
    use std::sync::atomic::Ordering;
    use std::time::SystemTime;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node{}", i)).collect()
    }

    async fn client_with(n: usize) -> (Client, Arc<MemoryConnector>, Vec<Arc<MemoryBackend>>) {
        let connector = Arc::new(MemoryConnector::new());
        let client = Client::with_connector(Vec::new(), ClientConfig::default(), connector.clone()).unwrap();

        let mut backends = Vec::new();
        for endpoint in endpoints(n) {
            assert!(client.add_node(&endpoint).await);
            backends.push(connector.backend(&endpoint));
        }
        (client, connector, backends)
    }

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn reset(backends: &[Arc<MemoryBackend>]) {
        for backend in backends {
            backend.calls().reset();
        }
    }

    fn get_calls(backends: &[Arc<MemoryBackend>]) -> usize {
        backends.iter().map(|b| b.calls().get.load(Ordering::SeqCst)).sum()
    }

    #[tokio::test]
    async fn test_set_writes_every_node() {
        let (client, _, backends) = client_with(3).await;
        client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();

        for backend in &backends {
            let wire = backend.peek("k").await.unwrap();
            assert_eq!(CacheItem::from_wire(wire).unwrap().value, b"v".to_vec());
        }
    }

    #[tokio::test]
    async fn test_get_reads_majority_of_large_clusters() {
        for (n, expected) in [(3, 2), (4, 2), (5, 3), (6, 3), (7, 4)] {
            let (client, _, backends) = client_with(n).await;
            client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();
            reset(&backends);

            client.get("k").await.unwrap();
            assert_eq!(get_calls(&backends), expected, "cluster of {}", n);
        }
    }

    #[tokio::test]
    async fn test_get_reads_all_of_small_clusters() {
        for n in [1, 2] {
            let (client, _, backends) = client_with(n).await;
            client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();
            reset(&backends);

            client.get("k").await.unwrap();
            assert_eq!(get_calls(&backends), n);
        }
    }

    #[tokio::test]
    async fn test_read_repair() {
        let (client, _, backends) = client_with(2).await;
        backends[0].insert(CacheItem::new("k", b"v".to_vec()).to_wire()).await;

        let item = client.get("k").await.unwrap();
        assert_eq!(item.value, b"v".to_vec());

        let repaired = backends[1].clone();
        eventually(|| {
            let repaired = repaired.clone();
            async move { repaired.peek("k").await.is_some() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_get_miss() {
        let (client, _, _) = client_with(3).await;
        assert!(matches!(client.get("missing").await, Err(CacheError::CacheMiss)));
    }

    #[tokio::test]
    async fn test_add_conflict_keeps_first_value() {
        let (client, _, _) = client_with(1).await;

        client.add(CacheItem::new("k", b"v1".to_vec())).await.unwrap();
        assert!(matches!(
            client.add(CacheItem::new("k", b"v2".to_vec())).await,
            Err(CacheError::NotStored)
        ));
        assert_eq!(client.get("k").await.unwrap().value, b"v1".to_vec());
    }

    #[tokio::test]
    async fn test_lost_add_repairs_nodes_that_accepted() {
        let (client, _, backends) = client_with(2).await;
        backends[0].insert(CacheItem::new("k", b"existing".to_vec()).to_wire()).await;
        // node1 answers last, so the re-read settles on node0's value
        backends[1].set_delay(Duration::from_millis(30));
        reset(&backends);

        assert!(matches!(
            client.add(CacheItem::new("k", b"new".to_vec())).await,
            Err(CacheError::NotStored)
        ));

        let accepted = backends[1].clone();
        eventually(|| {
            let accepted = accepted.clone();
            async move { accepted.calls().set.load(Ordering::SeqCst) >= 1 }
        })
        .await;
        let accepted = backends[1].clone();
        eventually(|| {
            let accepted = accepted.clone();
            async move {
                match accepted.peek("k").await {
                    Some(wire) => CacheItem::from_wire(wire).unwrap().value == b"existing".to_vec(),
                    None => false,
                }
            }
        })
        .await;

        // the node that refused the add is left alone
        assert_eq!(backends[0].calls().set.load(Ordering::SeqCst), 0);
        let kept = CacheItem::from_wire(backends[0].peek("k").await.unwrap()).unwrap();
        assert_eq!(kept.value, b"existing".to_vec());
    }

    #[tokio::test]
    async fn test_no_healthy_nodes_makes_no_calls() {
        let (client, _, backends) = client_with(2).await;
        for backend in &backends {
            backend.set_available(false);
        }
        client.health_check().await.unwrap();
        assert_eq!(client.healthy_node_count().await, 0);
        reset(&backends);

        let item = CacheItem::new("k", b"v".to_vec());
        assert!(matches!(client.add(item.clone()).await, Err(CacheError::NoHealthyNodes)));
        assert!(matches!(client.set(item).await, Err(CacheError::NoHealthyNodes)));
        assert!(matches!(client.get("k").await, Err(CacheError::NoHealthyNodes)));
        assert!(matches!(client.delete("k").await, Err(CacheError::NoHealthyNodes)));
        assert!(matches!(client.touch("k", 10).await, Err(CacheError::NoHealthyNodes)));

        for backend in &backends {
            assert_eq!(backend.calls().total(), 0);
        }
    }

    #[tokio::test]
    async fn test_empty_client_has_no_healthy_nodes() {
        let (client, _, _) = client_with(0).await;
        assert!(matches!(client.get("k").await, Err(CacheError::NoHealthyNodes)));
    }

    #[tokio::test]
    async fn test_failed_node_is_excluded_then_restored() {
        let (client, _, backends) = client_with(3).await;

        backends[1].set_available(false);
        client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();
        assert_eq!(client.healthy_node_count().await, 2);

        reset(&backends);
        client.set(CacheItem::new("k2", b"v".to_vec())).await.unwrap();
        assert_eq!(backends[1].calls().total(), 0);

        backends[1].set_available(true);
        client.health_check().await.unwrap();
        assert_eq!(client.healthy_node_count().await, 3);
    }

    #[tokio::test]
    async fn test_set_fails_when_every_node_drops_out() {
        let (client, _, backends) = client_with(2).await;
        for backend in &backends {
            backend.set_available(false);
        }
        assert!(matches!(
            client.set(CacheItem::new("k", b"v".to_vec())).await,
            Err(CacheError::NoHealthyNodes)
        ));
        assert!(matches!(
            client.add(CacheItem::new("k", b"v".to_vec())).await,
            Err(CacheError::NoHealthyNodes)
        ));
    }

    #[tokio::test]
    async fn test_delete_and_touch() {
        let (client, _, backends) = client_with(2).await;
        client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();

        client.touch("k", 60).await.unwrap();
        client.delete("k").await.unwrap();
        for backend in &backends {
            assert!(backend.peek("k").await.is_none());
        }

        assert!(matches!(client.delete("k").await, Err(CacheError::CacheMiss)));
        assert!(matches!(client.touch("k", 60).await, Err(CacheError::CacheMiss)));
    }

    #[tokio::test]
    async fn test_partial_miss_on_delete() {
        let (client, _, backends) = client_with(2).await;
        backends[0].insert(CacheItem::new("k", b"v".to_vec()).to_wire()).await;

        assert!(matches!(client.delete("k").await, Err(CacheError::CacheMiss)));
        assert!(backends[0].peek("k").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_keys_rejected_before_dispatch() {
        let (client, _, backends) = client_with(2).await;
        let long = "k".repeat(251);

        assert!(matches!(client.get(&long).await, Err(CacheError::MalformedKey)));
        assert!(matches!(client.delete("has space").await, Err(CacheError::MalformedKey)));
        assert!(matches!(
            client.set(CacheItem::new("ctl\x01", b"v".to_vec())).await,
            Err(CacheError::MalformedKey)
        ));
        for backend in &backends {
            assert_eq!(backend.calls().total(), 0);
        }
    }

    #[tokio::test]
    async fn test_expiration_survives_the_cluster() {
        let (client, _, _) = client_with(2).await;
        let expires = SystemTime::now() + Duration::from_secs(300);
        let item = CacheItem::new("k", b"v".to_vec()).with_expiration(expires);

        client.set(item).await.unwrap();
        let fetched = client.get("k").await.unwrap();
        assert_eq!(
            fetched.expiration.map(cacheha_common::unix_seconds),
            Some(cacheha_common::unix_seconds(expires))
        );
    }

    #[tokio::test]
    async fn test_foreign_values_are_not_returned() {
        let (client, _, backends) = client_with(1).await;
        backends[0]
            .insert(WireItem {
                key: "raw".to_string(),
                value: b"written by something else".to_vec(),
                flags: 0,
                expiration: 0,
            })
            .await;

        assert!(matches!(client.get("raw").await, Err(CacheError::CacheMiss)));
        assert_eq!(client.healthy_node_count().await, 1);
    }

    #[tokio::test]
    async fn test_start_stop_misuse() {
        let (client, _, _) = client_with(0).await;

        assert!(matches!(client.stop().await, Err(CacheError::NotRunning)));
        client.start().await.unwrap();
        assert!(client.is_running().await);
        assert!(matches!(client.start().await, Err(CacheError::AlreadyRunning)));
        client.stop().await.unwrap();
        assert!(!client.is_running().await);
        assert!(matches!(client.stop().await, Err(CacheError::NotRunning)));

        // restartable
        client.start().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_waits_for_stop_to_finish() {
        let connector = Arc::new(MemoryConnector::new());
        // the first tick probes "a" and keeps the loop busy
        connector.backend("a").set_delay(Duration::from_millis(200));
        let config = ClientConfig::default().with_tick_interval(Duration::from_millis(10));
        let client = Client::with_connector(
            vec![Box::new(crate::StaticNodeSource::new(["a"]))],
            config,
            connector.clone(),
        )
        .unwrap();

        client.start().await.unwrap();
        let backend = connector.backend("a");
        eventually(|| {
            let backend = backend.clone();
            async move { backend.calls().get.load(Ordering::SeqCst) >= 1 }
        })
        .await;

        let client_ref = &client;
        let (stopped_at, started_at) = tokio::join!(
            async move {
                client_ref.stop().await.unwrap();
                Instant::now()
            },
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                client_ref.start().await.unwrap();
                Instant::now()
            }
        );
        assert!(started_at >= stopped_at);
        assert!(client.is_running().await);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_discovers_nodes() {
        let connector = Arc::new(MemoryConnector::new());
        let config = ClientConfig::default().with_tick_interval(Duration::from_millis(10));
        let client = Client::with_connector(
            vec![Box::new(crate::StaticNodeSource::new(["a", "b"]))],
            config,
            connector,
        )
        .unwrap();

        client.start().await.unwrap();
        client
            .wait_for_healthy_node(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        let client_ref = &client;
        eventually(|| async move { client_ref.node_count().await == 2 }).await;
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_healthy_node_times_out() {
        let (client, _, _) = client_with(0).await;
        let started = Instant::now();
        let result = client.wait_for_healthy_node(started + Duration::from_millis(150)).await;
        assert!(matches!(result, Err(CacheError::NoHealthyNodes)));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_node_management() {
        let (client, _, _) = client_with(2).await;
        assert!(!client.add_node("node0").await);
        assert_eq!(client.node_count().await, 2);

        assert!(client.remove_node("node0").await);
        assert!(!client.remove_node("node0").await);
        assert_eq!(client.node_count().await, 1);
        assert_eq!(client.nodes_with_status().await[0].endpoint, "node1");
    }

    #[tokio::test]
    async fn test_get_info() {
        let (client, _, backends) = client_with(2).await;
        backends[0].set_available(false);
        client.health_check().await.unwrap();

        let info = client.get_info().await.unwrap();
        assert_eq!(info["running"], false);
        assert_eq!(info["total_nodes"], 2);
        assert_eq!(info["healthy_nodes"], 1);
        assert_eq!(info["unhealthy_nodes"], 1);
        assert_eq!(info["nodes"][0]["endpoint"], "node0");
        assert_eq!(info["nodes"][0]["healthy"], false);
        assert_eq!(info["config"]["node_timeout_ms"], 100);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::default().with_node_timeout(Duration::ZERO);
        assert!(matches!(
            Client::with_config(Vec::new(), config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_guarded_turns_panic_into_unknown() {
        let fail = true;
        let result: Result<()> = guarded(async move {
            if fail {
                panic!("aggregation bug");
            }
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CacheError::Unknown)));
    }
}
