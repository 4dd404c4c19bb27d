use std::collections::HashSet;
use std::sync::Arc;

use cacheha_common::backend::Connector;
use cacheha_common::{CacheError, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::discovery::NodeSource;
use crate::node::Node;
use crate::node_list::NodeList;

/// Membership changes made by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Background maintenance for a [`NodeList`].
///
/// Runs a single loop that wakes every `tick_interval` and, when due,
/// refreshes membership from the node sources and probes every node.
pub struct Scheduler {
    nodes: Arc<NodeList>,
    sources: Vec<Box<dyn NodeSource>>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
}

impl Scheduler {
    pub fn new(
        nodes: Arc<NodeList>,
        sources: Vec<Box<dyn NodeSource>>,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Self {
        Self {
            nodes,
            sources,
            connector,
            config,
        }
    }

    /// Runs one discovery pass.
    ///
    /// Every source is queried before anything changes, so a failing source
    /// leaves membership untouched. Unseen endpoints are probed and added,
    /// endpoints no source reports any more are removed. With no sources
    /// configured the pass does nothing.
    ///
    /// # Returns
    /// The endpoints added and removed, each sorted.
    pub async fn discover_nodes(&self) -> Result<DiscoveryReport> {
        if self.sources.is_empty() {
            return Ok(DiscoveryReport::default());
        }

        let mut current = HashSet::new();
        for source in &self.sources {
            current.extend(source.get_nodes().await?);
        }

        let mut fresh = Vec::new();
        for endpoint in &current {
            if !self.nodes.exists(endpoint).await {
                let backend = self.connector.connect(endpoint, self.config.node_timeout);
                fresh.push(Arc::new(Node::new(endpoint.clone(), backend)));
            }
        }

        // probe before the node can be picked for traffic
        let probes = fresh.iter().map(|node| async move {
            if let Err(e) = node.health_check().await {
                warn!("Initial probe of node {} failed: {}", node.endpoint(), e);
            }
        });
        futures::future::join_all(probes).await;

        let mut added = Vec::new();
        for node in fresh {
            let endpoint = node.endpoint().to_string();
            if self.nodes.add(node).await {
                added.push(endpoint);
            }
        }

        let mut removed = self.nodes.remove_except(&current).await;

        added.sort();
        removed.sort();
        let report = DiscoveryReport { added, removed };
        if !report.is_empty() {
            info!(
                "Discovery added {} and removed {} nodes",
                report.added.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    /// Probes every registered node.
    pub async fn health_check(&self) -> Result<()> {
        self.nodes.health_check().await
    }

    /// Starts the maintenance loop on a background task.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            scheduler.run(stop_rx).await;
        });
        info!("Scheduler started");
        SchedulerHandle { stop_tx, task }
    }

    /// Main loop
    async fn run(self: Arc<Self>, mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_discovery: Option<Instant> = None;
        let mut last_health_check: Option<Instant> = None;

        loop {
            tokio::select! {
                ack = stop_rx.recv() => {
                    info!("Scheduler stopped");
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if is_due(last_discovery, self.config.discovery_interval) {
                        last_discovery = Some(Instant::now());
                        match self.discover_nodes().await {
                            Ok(report) => debug!("Discovery pass complete: {:?}", report),
                            Err(e) => error!("Node discovery failed: {}", e),
                        }
                    }

                    if is_due(last_health_check, self.config.health_check_interval) {
                        last_health_check = Some(Instant::now());
                        if let Err(e) = self.health_check().await {
                            warn!("Health check failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

fn is_due(last: Option<Instant>, interval: std::time::Duration) -> bool {
    last.map_or(true, |at| at.elapsed() >= interval)
}

/// Controls a running scheduler loop.
pub struct SchedulerHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop, returning once it has acknowledged and exited.
    pub async fn stop(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.stop_tx.send(ack_tx).await.map_err(|_| CacheError::NotRunning)?;
        ack_rx.await.map_err(|_| CacheError::NotRunning)?;
        self.task.await.map_err(|e| {
            error!("Scheduler task failed: {}", e);
            CacheError::Unknown
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
