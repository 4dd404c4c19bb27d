//! CacheHA Integration Tests
//!
//! Drives the client against real memcached-protocol servers on loopback:
//! - Fan-out writes and majority reads over TCP
//! - Read repair after a server loses its data
//! - Failover when a server goes away, recovery when it returns
//! - Membership from the cluster auto-discovery protocol

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use cacheha_client::{Client, ClientConfig, ClusterConfigNodeSource, StaticNodeSource};
use cacheha_common::transport::{ClusterHandle, MemcacheServer, MemoryBackend};
use cacheha_common::{CacheError, CacheItem};
use tokio::task::JoinHandle;

struct TestServer {
    addr: String,
    store: Arc<MemoryBackend>,
    cluster: ClusterHandle,
    handle: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let server = MemcacheServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let store = server.store();
    let cluster = server.cluster_handle();
    let handle = server.spawn();
    TestServer {
        addr,
        store,
        cluster,
        handle,
    }
}

fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_node_timeout(Duration::from_millis(500))
        .with_health_check_interval(Duration::from_millis(100))
        .with_tick_interval(Duration::from_millis(20))
}

async fn started_client(servers: &[TestServer]) -> Client {
    let endpoints: Vec<String> = servers.iter().map(|s| s.addr.clone()).collect();
    let client = Client::with_config(vec![Box::new(StaticNodeSource::new(endpoints))], test_config()).unwrap();
    client.start().await.unwrap();
    client
        .wait_for_healthy_node(Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();
    let expected = servers.len();
    let client_ref = &client;
    wait_until(|| async move { client_ref.healthy_node_count().await == expected }).await;
    client
}

async fn wait_until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ============================================================================
// Basic Operations
// ============================================================================

#[tokio::test]
async fn test_set_get_delete_over_tcp() {
    let servers = vec![start_server().await, start_server().await, start_server().await];
    let client = started_client(&servers).await;

    let item = CacheItem::new("user:1", b"alice".to_vec()).with_flags(7);
    client.set(item.clone()).await.unwrap();

    for server in &servers {
        assert!(server.store.peek("user:1").await.is_some());
    }

    let fetched = client.get("user:1").await.unwrap();
    assert_eq!(fetched.value, b"alice".to_vec());
    assert_eq!(fetched.flags, 7);

    client.touch("user:1", 120).await.unwrap();
    client.delete("user:1").await.unwrap();
    assert!(matches!(client.get("user:1").await, Err(CacheError::CacheMiss)));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_add_over_tcp() {
    let servers = vec![start_server().await, start_server().await];
    let client = started_client(&servers).await;

    client.add(CacheItem::new("lock", b"v1".to_vec())).await.unwrap();
    assert!(matches!(
        client.add(CacheItem::new("lock", b"v2".to_vec())).await,
        Err(CacheError::NotStored)
    ));
    assert_eq!(client.get("lock").await.unwrap().value, b"v1".to_vec());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_expired_items_are_not_written() {
    let servers = vec![start_server().await];
    let client = started_client(&servers).await;

    let item = CacheItem::new("old", b"v".to_vec()).with_expiration(SystemTime::now() - Duration::from_secs(1));
    client.set(item).await.unwrap();
    assert!(servers[0].store.peek("old").await.is_none());

    client.stop().await.unwrap();
}

// ============================================================================
// Repair and Failover
// ============================================================================

#[tokio::test]
async fn test_read_repair_over_tcp() {
    let servers = vec![start_server().await, start_server().await];
    let client = started_client(&servers).await;

    // only the first server has the value, as after a restart of the second
    servers[0].store.insert(CacheItem::new("k", b"v".to_vec()).to_wire()).await;

    assert_eq!(client.get("k").await.unwrap().value, b"v".to_vec());
    let repaired = &servers[1].store;
    wait_until(|| async move { repaired.peek("k").await.is_some() }).await;

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_failover_and_recovery() {
    let servers = vec![start_server().await, start_server().await, start_server().await];
    let client = started_client(&servers).await;

    client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();

    servers[0].store.set_available(false);
    client.health_check().await.unwrap();
    assert_eq!(client.healthy_node_count().await, 2);

    // the survivors keep serving
    assert_eq!(client.get("k").await.unwrap().value, b"v".to_vec());
    client.set(CacheItem::new("k2", b"v2".to_vec())).await.unwrap();

    servers[0].store.set_available(true);
    let client_ref = &client;
    wait_until(|| async move { client_ref.healthy_node_count().await == 3 }).await;

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_dead_server_is_excluded() {
    let servers = vec![start_server().await, start_server().await];
    let client = started_client(&servers).await;

    servers[1].handle.abort();
    client.set(CacheItem::new("k", b"v".to_vec())).await.unwrap();
    let client_ref = &client;
    wait_until(|| async move { client_ref.healthy_node_count().await == 1 }).await;

    assert_eq!(client.get("k").await.unwrap().value, b"v".to_vec());
    assert_eq!(client.node_count().await, 2);

    client.stop().await.unwrap();
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_cluster_config_discovery() {
    let config_server = start_server().await;
    let a = start_server().await;
    let b = start_server().await;
    let c = start_server().await;

    config_server.cluster.publish(vec![a.addr.clone(), b.addr.clone()]).await;

    let client = Client::with_config(
        vec![Box::new(ClusterConfigNodeSource::new(config_server.addr.clone()))],
        test_config(),
    )
    .unwrap();

    let report = client.discover_nodes().await.unwrap();
    let mut expected = vec![a.addr.clone(), b.addr.clone()];
    expected.sort();
    assert_eq!(report.added, expected);
    assert_eq!(client.healthy_node_count().await, 2);

    // membership follows the published config
    config_server.cluster.publish(vec![b.addr.clone(), c.addr.clone()]).await;
    let report = client.discover_nodes().await.unwrap();
    assert_eq!(report.added, vec![c.addr.clone()]);
    assert_eq!(report.removed, vec![a.addr.clone()]);
}

#[tokio::test]
async fn test_missing_cluster_config_keeps_membership() {
    let config_server = start_server().await;
    let a = start_server().await;

    let client = Client::with_config(
        vec![Box::new(ClusterConfigNodeSource::new(config_server.addr.clone()))],
        test_config(),
    )
    .unwrap();
    assert!(client.add_node(&a.addr).await);

    assert!(matches!(client.discover_nodes().await, Err(CacheError::Discovery(_))));
    assert_eq!(client.node_count().await, 1);
}
