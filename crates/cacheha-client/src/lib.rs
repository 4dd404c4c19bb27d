// Copyright 2025 CacheHA Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # CacheHA Client
//!
//! High availability for memcached clusters whose servers do not replicate.
//!
//! Every write goes to every healthy server, reads consult a random majority,
//! and servers found missing a value are repaired in the background. A
//! scheduler keeps membership in sync with the configured [`NodeSource`]s
//! and probes each server so that unreachable ones stop receiving traffic.
//!
//! # Components
//!
//! - [`Client`] - The cache operations and their fan-out/repair policy
//! - [`Node`] / [`NodeList`] - Per-server health tracking and the registry
//! - [`NodeSource`] - Static, DNS and cluster-config endpoint discovery
//! - [`Scheduler`] - Periodic discovery and health checking
//!
//! # Example
//!
//! ```no_run
//! use cacheha_client::{Client, StaticNodeSource};
//! use cacheha_common::CacheItem;
//! use std::time::{Duration, Instant};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(vec![Box::new(StaticNodeSource::new([
//!     "10.0.0.1:11211",
//!     "10.0.0.2:11211",
//!     "10.0.0.3:11211",
//! ]))])?;
//! client.start().await?;
//! client.wait_for_healthy_node(Instant::now() + Duration::from_secs(1)).await?;
//!
//! client.set(CacheItem::new("greeting", b"hello".to_vec())).await?;
//! let item = client.get("greeting").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod node;
pub mod node_list;
pub mod scheduler;

pub use client::Client;
pub use config::ClientConfig;
pub use discovery::{ClusterConfigNodeSource, DnsNodeSource, NodeSource, StaticNodeSource};
pub use node::{Node, NodeResponse, NodeStatus, Operation, ResponseSender};
pub use node_list::NodeList;
pub use scheduler::{DiscoveryReport, Scheduler, SchedulerHandle};
