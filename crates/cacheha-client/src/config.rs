use std::time::Duration;

use cacheha_common::{CacheError, Result};

/// Timing configuration for the HA client.
///
/// Controls how often the background scheduler refreshes membership and
/// probes nodes, and how long a single backend call may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How often node sources are re-polled.
    ///
    /// Default: 10s
    pub discovery_interval: Duration,
    /// How often every registered node is probed.
    ///
    /// Default: 5s
    pub health_check_interval: Duration,
    /// Per-call timeout handed to each backend, connection setup included.
    ///
    /// Default: 100ms
    pub node_timeout: Duration,
    /// Granularity of the scheduler loop.
    ///
    /// Default: 100ms
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            node_timeout: Duration::from_millis(100),
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Checks that every duration is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("discovery_interval", self.discovery_interval),
            ("health_check_interval", self.health_check_interval),
            ("node_timeout", self.node_timeout),
            ("tick_interval", self.tick_interval),
        ];
        for (name, value) in fields {
            if value.is_zero() {
                return Err(CacheError::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}
