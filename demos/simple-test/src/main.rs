use std::time::{Duration, Instant};

use cacheha_client::{Client, ClientConfig, StaticNodeSource};
use cacheha_common::transport::MemcacheServer;
use cacheha_common::CacheItem;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut endpoints = Vec::new();
    let mut stores = Vec::new();
    for _ in 0..3 {
        let server = MemcacheServer::bind("127.0.0.1:0").await?;
        endpoints.push(server.local_addr()?.to_string());
        stores.push(server.store());
        server.spawn();
    }
    info!("Started memcache servers on {}", endpoints.join(", "));

    let config = ClientConfig::default().with_health_check_interval(Duration::from_millis(500));
    let client = Client::with_config(vec![Box::new(StaticNodeSource::new(endpoints.clone()))], config)?;
    client.start().await?;
    client.wait_for_healthy_node(Instant::now() + Duration::from_secs(2)).await?;

    println!("Writing greeting to every node...");
    let item = CacheItem::new("greeting", b"hello from cacheha".to_vec()).with_ttl(Duration::from_secs(60));
    client.set(item).await?;

    println!("Taking {} down", endpoints[0]);
    stores[0].set_available(false);
    client.health_check().await?;

    match client.get("greeting").await {
        Ok(item) => println!("Success! Result: {}", String::from_utf8_lossy(&item.value)),
        Err(e) => eprintln!("Error: {}", e),
    }

    println!("Bringing {} back", endpoints[0]);
    stores[0].set_available(true);
    client.health_check().await?;

    // a value only one node knows about gets copied to the others on read
    stores[1].insert(CacheItem::new("stray", b"only on one node".to_vec()).to_wire()).await;
    for _ in 0..3 {
        // a read may land on two nodes that both miss
        if let Err(e) = client.get("stray").await {
            println!("Read of stray missed: {}", e);
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let copies = count_holding(&stores).await;
    println!("Nodes holding stray after repair: {}/{}", copies, stores.len());

    println!("{}", serde_json::to_string_pretty(&client.get_info().await?)?);

    client.stop().await?;
    Ok(())
}

async fn count_holding(stores: &[std::sync::Arc<cacheha_common::transport::MemoryBackend>]) -> usize {
    let mut count = 0;
    for store in stores {
        if store.peek("stray").await.is_some() {
            count += 1;
        }
    }
    count
}
