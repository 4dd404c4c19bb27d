//! CacheHA Transport Layer
//!
//! Backends that speak to a single cache server, plus the pieces needed to
//! stand one up locally.
//!
//! # Components
//!
//! - **[`MemcacheCodec`]**: Memcached text protocol encoding/decoding
//! - **[`MemcacheBackend`]**: Async TCP client for one memcached endpoint
//! - **[`MemoryBackend`]**: In-process store with memcached semantics
//! - **[`MemcacheServer`]**: Memcached-compatible TCP server over a [`MemoryBackend`]
//!
//! # Timeouts
//!
//! Every [`MemcacheBackend`] call, including the lazy connect, is bounded by
//! the timeout given at construction (100ms by default).
//!
//! # Example
//!
//! ```no_run
//! use cacheha_common::backend::Backend;
//! use cacheha_common::transport::{MemcacheBackend, DEFAULT_TIMEOUT};
//!
//! # async fn example() -> cacheha_common::Result<()> {
//! let backend = MemcacheBackend::new("127.0.0.1:11211", DEFAULT_TIMEOUT);
//! let item = backend.get("user:42").await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod memory;
pub mod tcp;
pub mod tcp_server;

pub use codec::{validate_key, MemcacheCodec, StoreCommand, MAX_KEY_LENGTH};
pub use memory::{MemoryBackend, MemoryConnector};
pub use tcp::{MemcacheBackend, MemcacheConnector, DEFAULT_TIMEOUT};
pub use tcp_server::{ClusterHandle, MemcacheServer};
