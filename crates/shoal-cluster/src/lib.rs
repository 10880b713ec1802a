//! shoal-cluster: slot-aware routing for sharded key-value clusters.
//!
//! The keyspace of a cluster is partitioned into 16384 hash slots, each
//! owned by one primary node. This crate keeps a versioned, immutable
//! snapshot of the slot → node mapping per cluster, routes each command
//! to the owning node's connection pool, and recovers from topology
//! changes by refreshing the snapshot and retrying within a bounded
//! budget. Callers never see `MOVED`; they see their reply or a
//! definitive error.
//!
//! # Architecture
//!
//! - **Slot hashing** ([`key_slot`]): CRC16 with hash-tag extraction,
//!   matching the server's own partitioning.
//! - **Snapshot** ([`Snapshot`]): immutable `{version, slot map, pools}`
//!   value; requests capture one and route against it for their lifetime.
//! - **Monitor**: one background task per cluster, the only writer of the
//!   snapshot, serializing rebuilds and coalescing refresh requests by
//!   observed version.
//! - **Dispatcher** ([`Cluster`]): `q`/`qk`/pipelines/`transaction` plus
//!   the retry/refresh state machine.
//! - **Multi-pool dispatch**: cross-slot pipelines (`qmn`) re-stitched in
//!   input order, and fan-out (`qa`).
//! - **Helpers**: EVALSHA fast path with NOSCRIPT fallback, optimistic
//!   locking over WATCH/MULTI/EXEC.
//! - **Registry** ([`Registry`]): multiple named clusters side by side.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use shoal_cluster::{cmd, ClusterConfig, NodeAddr, Registry};
//!
//! # async fn example() -> Result<(), shoal_cluster::ClusterError> {
//! let registry = Registry::new();
//! let config = ClusterConfig::new(
//!     "main",
//!     vec!["10.0.0.1:7001".parse().unwrap(), "10.0.0.2:7002".parse().unwrap()],
//! );
//! let cluster = registry.connect(config).await?;
//!
//! cluster.q(&cmd(&["SET", "user:42", "alice"])).await?;
//! let reply = cluster.q(&cmd(&["GET", "user:42"])).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

mod client;
mod command;
mod config;
mod error;
mod locking;
mod monitor;
mod multi;
mod registry;
mod script;
mod slot;
mod topology;

pub use client::Cluster;
pub use command::{cmd, command_key, pipeline_key};
pub use config::{ClusterConfig, CAS_ATTEMPTS, REQUEST_TTL, RETRY_DELAY};
pub use error::ClusterError;
pub use registry::Registry;
pub use script::script_sha;
pub use slot::{key_slot, SLOT_COUNT};
pub use topology::Snapshot;

pub use bytes::Bytes;
pub use shoal_pool::{NodeAddr, Pool, PoolError, PooledWorker, Worker, WorkerError};
pub use shoal_protocol::Frame;
