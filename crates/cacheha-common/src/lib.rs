//! CacheHA Common Types and Transport
//!
//! This crate provides the item encoding, error taxonomy and memcached
//! transport shared by the CacheHA client.
//!
//! # Overview
//!
//! CacheHA layers high availability over a set of memcached servers that do
//! not replicate among themselves. Every value written through it carries a
//! small header so that the absolute expiry survives copying between nodes:
//!
//! - **Wire Format**: `[4-byte magic FD 37 D3 1B] + [4-byte big-endian unix expiry] + [payload]`
//! - **Expiry `0`**: never expires
//!
//! # Components
//!
//! - [`protocol`] - Item encoding and the error taxonomy
//! - [`backend`] - The per-server [`Backend`] trait and its [`Connector`]
//! - [`transport`] - Memcached TCP client, in-memory store and test server
//!
//! # Example
//!
//! ```no_run
//! use cacheha_common::{CacheItem, CacheError};
//! use std::time::Duration;
//!
//! let item = CacheItem::new("session:1", b"payload".to_vec())
//!     .with_ttl(Duration::from_secs(60));
//! let wire = item.to_wire();
//! let decoded = CacheItem::from_wire(wire)?;
//! # Ok::<(), CacheError>(())
//! ```

pub mod backend;
pub mod protocol;
pub mod transport;

pub use backend::{Backend, Connector};
pub use protocol::*;
