use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::protocol::error::{CacheError, Result};
use crate::protocol::WireItem;
use crate::transport::codec::{Command, MemcacheCodec, StoreCommand};
use crate::transport::memory::MemoryBackend;

/// Maximum data block accepted from a client.
const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Published cluster membership for `config get cluster`.
#[derive(Debug, Clone, Default)]
struct ClusterConfig {
    version: u64,
    endpoints: Vec<String>,
}

/// Memcached-compatible TCP server over a [`MemoryBackend`].
///
/// Speaks enough of the text protocol for the HA client: `get`, `set`,
/// `add`, `delete`, `touch`, `version` and the cluster auto-discovery
/// command `config get cluster`. Used to run real-socket integration tests
/// and local demos.
pub struct MemcacheServer {
    listener: TcpListener,
    store: Arc<MemoryBackend>,
    cluster: Arc<RwLock<Option<ClusterConfig>>>,
}

impl MemcacheServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "127.0.0.1:0")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            store: Arc::new(MemoryBackend::new()),
            cluster: Arc::new(RwLock::new(None)),
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| CacheError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// The storage behind this server.
    pub fn store(&self) -> Arc<MemoryBackend> {
        self.store.clone()
    }

    /// Handle for publishing cluster membership after the server is spawned.
    pub fn cluster_handle(&self) -> ClusterHandle {
        ClusterHandle {
            cluster: self.cluster.clone(),
        }
    }

    /// Runs the accept loop on a background task.
    ///
    /// Aborting the returned handle stops the server and drops every open
    /// connection.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                info!("Memcache server stopped: {}", e);
            }
        })
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| CacheError::Connection(format!("Failed to accept connection: {}", e)))?;

            debug!("Connection established from {}", peer_addr);

            let store = self.store.clone();
            let cluster = self.cluster.clone();
            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, store, cluster).await {
                    debug!("Connection from {} closed: {}", peer_addr, e);
                }
            });

            // reap finished connections
            while connections.try_join_next().is_some() {}
        }
    }
}

/// Updates the cluster config served by a running [`MemcacheServer`].
#[derive(Clone)]
pub struct ClusterHandle {
    cluster: Arc<RwLock<Option<ClusterConfig>>>,
}

impl ClusterHandle {
    /// Publishes a new member list, bumping the config version.
    pub async fn publish(&self, endpoints: Vec<String>) {
        let mut cluster = self.cluster.write().await;
        let version = cluster.as_ref().map_or(1, |c| c.version + 1);
        *cluster = Some(ClusterConfig { version, endpoints });
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<MemoryBackend>,
    cluster: Arc<RwLock<Option<ClusterConfig>>>,
) -> Result<()> {
    let mut conn = BufReader::new(stream);

    loop {
        let mut line = Vec::new();
        if conn.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let command = match MemcacheCodec::decode_command(&line) {
            Ok(command) => command,
            Err(_) => {
                conn.get_mut().write_all(b"ERROR\r\n").await?;
                continue;
            }
        };

        let reply = match command {
            Command::Quit => return Ok(()),
            Command::Version => b"VERSION cacheha-memory\r\n".to_vec(),
            Command::Get { keys } => {
                let mut reply = Vec::new();
                for key in keys {
                    match store.get(&key).await {
                        Ok(item) => reply.extend_from_slice(&MemcacheCodec::encode_value(&item)),
                        Err(CacheError::CacheMiss) => {}
                        Err(e) => {
                            reply = error_line(&e);
                            break;
                        }
                    }
                }
                if !reply.starts_with(b"SERVER_ERROR") && !reply.starts_with(b"CLIENT_ERROR") {
                    reply.extend_from_slice(b"END\r\n");
                }
                reply
            }
            Command::Store {
                command,
                key,
                flags,
                expiration,
                bytes,
                noreply,
            } => {
                if bytes > MAX_VALUE_SIZE {
                    conn.get_mut().write_all(b"SERVER_ERROR object too large for cache\r\n").await?;
                    return Ok(());
                }
                let mut data = vec![0u8; bytes + 2];
                conn.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    conn.get_mut().write_all(b"CLIENT_ERROR bad data chunk\r\n").await?;
                    continue;
                }
                data.truncate(bytes);

                let item = WireItem {
                    key,
                    value: data,
                    flags,
                    expiration,
                };
                let outcome = match command {
                    StoreCommand::Set => store.set(&item).await,
                    StoreCommand::Add => store.add(&item).await,
                };
                if noreply {
                    continue;
                }
                match outcome {
                    Ok(()) => b"STORED\r\n".to_vec(),
                    Err(CacheError::NotStored) => b"NOT_STORED\r\n".to_vec(),
                    Err(e) => error_line(&e),
                }
            }
            Command::Delete { key, noreply } => {
                let outcome = store.delete(&key).await;
                if noreply {
                    continue;
                }
                match outcome {
                    Ok(()) => b"DELETED\r\n".to_vec(),
                    Err(CacheError::CacheMiss) => b"NOT_FOUND\r\n".to_vec(),
                    Err(e) => error_line(&e),
                }
            }
            Command::Touch {
                key,
                expiration,
                noreply,
            } => {
                let outcome = store.touch(&key, expiration).await;
                if noreply {
                    continue;
                }
                match outcome {
                    Ok(()) => b"TOUCHED\r\n".to_vec(),
                    Err(CacheError::CacheMiss) => b"NOT_FOUND\r\n".to_vec(),
                    Err(e) => error_line(&e),
                }
            }
            Command::ConfigGet { name } => {
                let cluster = cluster.read().await;
                match (name.as_str(), cluster.as_ref()) {
                    ("cluster", Some(config)) => {
                        MemcacheCodec::encode_cluster_config(config.version, &config.endpoints)
                    }
                    _ => b"END\r\n".to_vec(),
                }
            }
        };

        conn.get_mut().write_all(&reply).await?;
    }
}

fn error_line(err: &CacheError) -> Vec<u8> {
    match err {
        CacheError::MalformedKey => b"CLIENT_ERROR bad command line format\r\n".to_vec(),
        other => format!("SERVER_ERROR {}\r\n", other).into_bytes(),
    }
}
