//! Per-cluster configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use shoal_pool::{NodeAddr, PoolOptions};

/// Attempts per request before the dispatcher gives up.
pub const REQUEST_TTL: u32 = 16;

/// Sleep between retry attempts, throttling refresh storms.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Rounds an optimistic-locking transaction may retry on contention.
pub const CAS_ATTEMPTS: u32 = 5;

/// How long a pool checkout may wait before failing with no-connection.
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one cluster.
///
/// `nodes` are the init nodes tried in order for the first slot-map
/// fetch; listing several tolerates some being down. After the first
/// successful fetch, discovery prefers the nodes of the current map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique symbolic name identifying this cluster instance.
    pub name: String,

    /// Init nodes for topology discovery.
    pub nodes: Vec<NodeAddr>,

    /// Password sent via `AUTH` on every new connection.
    #[serde(default)]
    pub password: Option<String>,

    /// Baseline worker count per node.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Extra workers a pool may grow to under load.
    #[serde(default = "default_pool_overflow")]
    pub pool_overflow: usize,

    /// Attempts per request.
    #[serde(default = "default_request_ttl")]
    pub request_ttl: u32,

    /// Sleep between retry attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Optimistic-locking retry budget.
    #[serde(default = "default_cas_attempts")]
    pub cas_attempts: u32,

    /// Pool checkout timeout.
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout: Duration,
}

impl ClusterConfig {
    /// Creates a config with the default tuning for the given cluster
    /// name and init nodes.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeAddr>) -> Self {
        Self {
            name: name.into(),
            nodes,
            password: None,
            pool_size: default_pool_size(),
            pool_overflow: default_pool_overflow(),
            request_ttl: default_request_ttl(),
            retry_delay: default_retry_delay(),
            cas_attempts: default_cas_attempts(),
            checkout_timeout: default_checkout_timeout(),
        }
    }

    pub(crate) fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.pool_size,
            max_overflow: self.pool_overflow,
            password: self.password.clone(),
            checkout_timeout: self.checkout_timeout,
        }
    }
}

fn default_pool_size() -> usize {
    PoolOptions::default().size
}

fn default_pool_overflow() -> usize {
    PoolOptions::default().max_overflow
}

fn default_request_ttl() -> u32 {
    REQUEST_TTL
}

fn default_retry_delay() -> Duration {
    RETRY_DELAY
}

fn default_cas_attempts() -> u32 {
    CAS_ATTEMPTS
}

fn default_checkout_timeout() -> Duration {
    CHECKOUT_TIMEOUT
}
