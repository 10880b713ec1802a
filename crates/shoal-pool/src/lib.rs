//! shoal-pool: connection workers and bounded per-node pools.
//!
//! A [`Worker`] is one authenticated TCP connection to a cluster node. It
//! issues a single command or one pipelined batch at a time; commands sent
//! through the same worker are strictly ordered on its socket, which is
//! what WATCH/MULTI/EXEC sequences rely on.
//!
//! A [`Pool`] owns the workers for one node: a baseline of `size` reusable
//! connections plus up to `max_overflow` extra under load. Checkout is
//! bounded by a timeout so callers degrade to a routing retry instead of
//! blocking indefinitely when a node is saturated or down.

mod addr;
mod error;
mod pool;
mod worker;

pub use addr::{AddrParseError, NodeAddr};
pub use error::{PoolError, WorkerError};
pub use pool::{Pool, PoolOptions, PooledWorker};
pub use worker::Worker;
