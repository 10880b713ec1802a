//! Error types for workers and pools.

use thiserror::Error;

use crate::addr::NodeAddr;

/// Errors that can occur on a single worker connection.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport-level failure. The worker is poisoned and will be
    /// discarded by its pool on release.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-exchange. Distinct from [`Io`]
    /// because the dispatcher retries it without a topology refresh — the
    /// pool reconnects on the next checkout.
    ///
    /// [`Io`]: WorkerError::Io
    #[error("connection closed by peer")]
    Closed,

    /// The reply stream was malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] shoal_protocol::ProtocolError),

    /// The server rejected the `AUTH` handshake.
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Errors that can occur when checking a worker out of a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot of `size + max_overflow` stayed busy past the checkout
    /// timeout.
    #[error("pool for {addr} exhausted: checkout timed out")]
    Exhausted { addr: NodeAddr },

    /// The pool had capacity but establishing a fresh connection failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: NodeAddr,
        source: WorkerError,
    },
}
