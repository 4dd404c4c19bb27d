use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::backend::{Backend, Connector};
use crate::protocol::error::{CacheError, Result};
use crate::protocol::WireItem;
use crate::transport::codec::{validate_key, MemcacheCodec, StoreCommand};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest value block accepted from a server (memcached's default item limit).
const MAX_VALUE_SIZE: usize = 1024 * 1024;

type Connection = BufReader<TcpStream>;

/// Memcached text-protocol client for a single endpoint.
///
/// Owns at most one TCP connection, established lazily on first use and
/// re-established after any failure. Calls are serialized over that
/// connection; each one (including waiting its turn and connecting) must
/// finish within the configured timeout or it fails with
/// [`CacheError::Timeout`] and the connection is discarded.
pub struct MemcacheBackend {
    endpoint: String,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl MemcacheBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs `config get <name>` and returns the raw config payload.
    ///
    /// Used by cluster auto-discovery. A server without the config key
    /// answers with a bare `END`, reported as [`CacheError::CacheMiss`].
    pub async fn config_get(&self, name: &str) -> Result<Vec<u8>> {
        let request = MemcacheCodec::encode_config_get(name);
        self.exchange(|conn| {
            Box::pin(async move {
                conn.get_mut().write_all(&request).await?;
                let line = read_line(conn).await?;
                let Some(len) = MemcacheCodec::decode_config_header(&line)? else {
                    return Err(CacheError::CacheMiss);
                };
                let data = read_block(conn, len).await?;
                expect_end(conn).await?;
                Ok(data)
            })
        })
        .await
    }

    async fn store(&self, command: StoreCommand, item: &WireItem) -> Result<()> {
        validate_key(&item.key)?;
        let request = MemcacheCodec::encode_store(command, item);
        self.exchange(|conn| {
            Box::pin(async move {
                conn.get_mut().write_all(&request).await?;
                let line = read_line(conn).await?;
                MemcacheCodec::decode_store_reply(&line)
            })
        })
        .await
    }

    /// Runs one request/response exchange under the timeout.
    ///
    /// The timeout covers waiting for the connection, connecting and the
    /// exchange itself. Application-level replies (miss, not stored, ...)
    /// leave the connection in place; anything else drops it so the next
    /// call reconnects.
    async fn exchange<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut Connection,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'c>>,
    {
        // waiting for the connection counts against the call's budget
        let outcome = tokio::time::timeout(self.timeout, async {
            let mut slot = self.conn.lock().await;
            // held outside the slot so a timed-out exchange drops it
            let mut conn = match slot.take() {
                Some(conn) => conn,
                None => match self.connect().await {
                    Ok(conn) => conn,
                    Err(e) => return Err(e),
                },
            };
            let result = op(&mut conn).await;
            if result.as_ref().map_or_else(|e| e.is_reachable(), |_| true) {
                *slot = Some(conn);
            }
            result
        })
        .await
        .unwrap_or_else(|_| Err(CacheError::Timeout(self.timeout.as_millis() as u64)));

        outcome.map_err(|e| map_io_error(e, &self.endpoint, self.timeout))
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to connect to {}: {}", self.endpoint, e)))?;
        stream.set_nodelay(true)?;
        Ok(BufReader::new(stream))
    }
}

#[async_trait]
impl Backend for MemcacheBackend {
    async fn get(&self, key: &str) -> Result<WireItem> {
        validate_key(key)?;
        let request = MemcacheCodec::encode_get(key);
        self.exchange(|conn| {
            Box::pin(async move {
                conn.get_mut().write_all(&request).await?;
                let line = read_line(conn).await?;
                let Some(header) = MemcacheCodec::decode_value_header(&line)? else {
                    return Err(CacheError::CacheMiss);
                };
                if header.bytes > MAX_VALUE_SIZE {
                    return Err(CacheError::Protocol(format!(
                        "value too large: {} bytes (max {} bytes)",
                        header.bytes, MAX_VALUE_SIZE
                    )));
                }
                let value = read_block(conn, header.bytes).await?;
                expect_end(conn).await?;
                Ok(WireItem {
                    key: header.key,
                    value,
                    flags: header.flags,
                    expiration: 0,
                })
            })
        })
        .await
    }

    async fn set(&self, item: &WireItem) -> Result<()> {
        self.store(StoreCommand::Set, item).await
    }

    async fn add(&self, item: &WireItem) -> Result<()> {
        self.store(StoreCommand::Add, item).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let request = MemcacheCodec::encode_delete(key);
        self.exchange(|conn| {
            Box::pin(async move {
                conn.get_mut().write_all(&request).await?;
                let line = read_line(conn).await?;
                MemcacheCodec::decode_delete_reply(&line)
            })
        })
        .await
    }

    async fn touch(&self, key: &str, seconds: i32) -> Result<()> {
        validate_key(key)?;
        let request = MemcacheCodec::encode_touch(key, seconds);
        self.exchange(|conn| {
            Box::pin(async move {
                conn.get_mut().write_all(&request).await?;
                let line = read_line(conn).await?;
                MemcacheCodec::decode_touch_reply(&line)
            })
        })
        .await
    }
}

/// Creates a [`MemcacheBackend`] per endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcacheConnector;

impl Connector for MemcacheConnector {
    fn connect(&self, endpoint: &str, timeout: Duration) -> Arc<dyn Backend> {
        Arc::new(MemcacheBackend::new(endpoint, timeout))
    }
}

async fn read_line(conn: &mut Connection) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = conn.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(CacheError::Connection("connection closed by server".to_string()));
    }
    Ok(line)
}

/// Reads a data block of `len` bytes plus its trailing `\r\n`.
async fn read_block(conn: &mut Connection, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len + 2];
    conn.read_exact(&mut buf).await?;
    if !buf.ends_with(b"\r\n") {
        return Err(CacheError::Protocol("corrupt data block".to_string()));
    }
    buf.truncate(len);
    Ok(buf)
}

async fn expect_end(conn: &mut Connection) -> Result<()> {
    let line = read_line(conn).await?;
    if crate::transport::codec::trim_line(&line) != b"END" {
        return Err(CacheError::Protocol(format!(
            "expected END, got {}",
            String::from_utf8_lossy(&line).trim_end()
        )));
    }
    Ok(())
}

/// Map IO errors to connection-level variants.
///
/// - Timeouts/would block -> `Timeout`
/// - Connection errors -> `Connection`
/// - Everything else passes through
fn map_io_error(err: CacheError, endpoint: &str, timeout: Duration) -> CacheError {
    match err {
        CacheError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                CacheError::Timeout(timeout.as_millis() as u64)
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                CacheError::Connection(format!("{}: Connection lost", endpoint))
            }
            _ => CacheError::Io(io),
        },
        other => other,
    }
}
