//! Error types for cluster operations.

use thiserror::Error;

/// Errors surfaced to callers of the dispatcher.
///
/// Transient transport and routing failures are recovered internally by
/// retry + refresh; what reaches the caller is either a definitive server
/// reply or the exhaustion of the retry budget.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The command has no extractable routing key and is not a fan-out
    /// command.
    #[error("command has no routable key")]
    InvalidCommand,

    /// The retry budget ran out without a successful reply: the cluster
    /// has no known topology, or transport failures persisted across
    /// every attempt.
    #[error("no connection to cluster '{0}'")]
    NoConnection(String),

    /// An optimistic-locking transaction kept losing its watched key and
    /// exhausted its retry budget.
    #[error("resource busy: optimistic locking retries exhausted")]
    ResourceBusy,

    /// A server error outside the routing/state class, passed through
    /// verbatim.
    #[error("server error: {0}")]
    Server(String),

    /// A reply could not be parsed. Terminal: retrying on a desynchronized
    /// connection would misattribute replies.
    #[error("protocol error: {0}")]
    Protocol(#[from] shoal_protocol::ProtocolError),

    /// No cluster with this name is connected.
    #[error("cluster '{0}' is not connected")]
    UnknownCluster(String),

    /// A cluster with this name is already connected.
    #[error("cluster '{0}' is already connected")]
    DuplicateCluster(String),
}

/// Server error prefixes that signal stale routing or transient cluster
/// state. All of them are handled by refreshing the slot map and
/// retrying, never surfaced directly.
const ROUTING_ERROR_PREFIXES: [&str; 4] = ["MOVED ", "READONLY ", "CLUSTERDOWN ", "TRYAGAIN "];

/// Returns true if a server error message belongs to the routing/state
/// class that triggers refresh-and-retry.
pub(crate) fn is_routing_error(msg: &str) -> bool {
    ROUTING_ERROR_PREFIXES.iter().any(|p| msg.starts_with(p))
}
