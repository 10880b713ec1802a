//! Multi-pool dispatch: cross-slot pipelines and fan-out.
//!
//! [`qmn`] splits a pipeline whose commands hash to different slots into
//! one pipelined batch per pool, runs the batches in parallel, and
//! re-stitches the replies by original command index. The snapshot
//! version is captured when the buckets are built; any bucket's routing
//! signal abandons all partial results and replays the whole pipeline
//! against a refreshed map.
//!
//! [`qa`] fans a single command out to every pool of the current
//! snapshot, collecting all replies (error frames included) in pool
//! order and leaving the reduction to the caller.
//!
//! [`qmn`]: Cluster::qmn
//! [`qa`]: Cluster::qa

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use shoal_pool::{Pool, WorkerError};
use shoal_protocol::Frame;

use crate::client::{routing_error_in, Attempt, Backoff, Cluster, Reply};
use crate::command::command_key;
use crate::error::{is_routing_error, ClusterError};
use crate::slot::key_slot;

/// Commands destined for one pool, tagged with their original positions.
struct Bucket {
    pool: Arc<Pool>,
    indexes: Vec<usize>,
    commands: Vec<Vec<Bytes>>,
}

enum BucketOutcome {
    Frames(Vec<Frame>),
    /// Checkout or transport failure: refresh and replay.
    NoConnection,
    /// Peer closed the connection: replay without a refresh.
    Closed,
    Fatal(ClusterError),
}

impl Cluster {
    /// Runs a pipeline whose commands may hash to different slots.
    ///
    /// The reply list preserves the input order: reply `i` answers
    /// command `i`, regardless of how the commands were bucketed across
    /// pools. Any command without a routable key fails the whole call.
    pub async fn qmn(&self, commands: &[Vec<Bytes>]) -> Result<Vec<Frame>, ClusterError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let again = match self.qmn_attempt(commands).await? {
                Ok(results) => return Ok(results),
                Err(again) => again,
            };
            if attempt >= self.config().request_ttl {
                return Err(ClusterError::NoConnection(self.name().to_owned()));
            }
            self.backoff(again).await;
        }
    }

    /// One full split-execute-stitch round. The outer `Err` is terminal;
    /// the inner `Err` asks the retry loop to go again.
    async fn qmn_attempt(
        &self,
        commands: &[Vec<Bytes>],
    ) -> Result<Result<Vec<Frame>, Backoff>, ClusterError> {
        let Some(snapshot) = self.monitor().snapshot() else {
            return Ok(Err(Backoff::AwaitSnapshot));
        };
        let version = snapshot.version();

        // bucket by owning pool, preserving original order within each
        let mut bucket_of_pool: HashMap<usize, usize> = HashMap::new();
        let mut buckets: Vec<Bucket> = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            let key = command_key(command).ok_or(ClusterError::InvalidCommand)?;
            let slot = key_slot(key);
            let Some(pool_idx) = snapshot.pool_index(slot) else {
                debug!(slot, version, "slot unassigned while bucketing");
                return Ok(Err(Backoff::Refresh(version)));
            };

            let b = match bucket_of_pool.get(&pool_idx) {
                Some(&b) => b,
                None => {
                    buckets.push(Bucket {
                        pool: Arc::clone(&snapshot.pools()[pool_idx]),
                        indexes: Vec::new(),
                        commands: Vec::new(),
                    });
                    bucket_of_pool.insert(pool_idx, buckets.len() - 1);
                    buckets.len() - 1
                }
            };
            buckets[b].indexes.push(i);
            buckets[b].commands.push(command.clone());
        }

        let mut join = JoinSet::new();
        for bucket in buckets {
            join.spawn(run_bucket(bucket));
        }

        let mut results: Vec<Option<Frame>> = vec![None; commands.len()];
        let mut needs_refresh = false;
        let mut needs_replay = false;
        let mut fatal: Option<ClusterError> = None;

        while let Some(joined) = join.join_next().await {
            let (indexes, outcome) = joined.expect("bucket task panicked");
            match outcome {
                BucketOutcome::Frames(frames) => {
                    if let Some(msg) = routing_error_in(&frames) {
                        debug!(error = %msg, "routing error in bucket");
                        needs_refresh = true;
                    } else {
                        for (i, frame) in indexes.into_iter().zip(frames) {
                            results[i] = Some(frame);
                        }
                    }
                }
                BucketOutcome::NoConnection => needs_refresh = true,
                BucketOutcome::Closed => needs_replay = true,
                BucketOutcome::Fatal(e) => fatal = Some(e),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if needs_refresh {
            return Ok(Err(Backoff::Refresh(version)));
        }
        if needs_replay {
            return Ok(Err(Backoff::Plain));
        }

        let stitched = results
            .into_iter()
            .map(|r| r.expect("every command was routed to exactly one bucket"))
            .collect();
        Ok(Ok(stitched))
    }

    /// Fans a single command out to every pool of the current snapshot.
    ///
    /// Replies come back in pool order and include per-node error frames;
    /// callers decide how to reduce them.
    pub async fn qa(&self, command: &[Bytes]) -> Result<Vec<Frame>, ClusterError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.qa_attempt(command).await {
                Attempt::Done(Reply::Many(replies)) => return Ok(replies),
                Attempt::Done(Reply::Single(_)) => {
                    unreachable!("fan-out collects a reply list")
                }
                Attempt::Fail(err) => return Err(err),
                Attempt::Again(again) => {
                    if attempt >= self.config().request_ttl {
                        return Err(ClusterError::NoConnection(self.name().to_owned()));
                    }
                    self.backoff(again).await;
                }
            }
        }
    }

    async fn qa_attempt(&self, command: &[Bytes]) -> Attempt {
        let Some(snapshot) = self.monitor().snapshot() else {
            return Attempt::Again(Backoff::AwaitSnapshot);
        };
        let version = snapshot.version();

        let mut replies = Vec::with_capacity(snapshot.pools().len());
        for pool in snapshot.pools() {
            let mut worker = match pool.acquire().await {
                Ok(worker) => worker,
                Err(e) => {
                    debug!(node = %pool.addr(), error = %e, "fan-out checkout failed");
                    return Attempt::Again(Backoff::Refresh(version));
                }
            };
            match worker.query(command).await {
                Ok(Frame::Error(msg)) if is_routing_error(&msg) => {
                    debug!(node = %pool.addr(), error = %msg, "routing error during fan-out");
                    return Attempt::Again(Backoff::Refresh(version));
                }
                Ok(frame) => replies.push(frame),
                Err(e) => return crate::client::classify_transport(pool, e, version),
            }
        }
        Attempt::Done(Reply::Many(replies))
    }

    /// Flushes every node's database. Collapses the fan-out replies:
    /// `Ok` only when every node confirmed.
    pub async fn flushdb(&self) -> Result<(), ClusterError> {
        let replies = self.qa(&[Bytes::from_static(b"FLUSHDB")]).await?;
        for frame in replies {
            if let Frame::Error(msg) = frame {
                return Err(ClusterError::Server(msg));
            }
        }
        Ok(())
    }
}

async fn run_bucket(bucket: Bucket) -> (Vec<usize>, BucketOutcome) {
    let Bucket {
        pool,
        indexes,
        commands,
    } = bucket;

    let mut worker = match pool.acquire().await {
        Ok(worker) => worker,
        Err(e) => {
            debug!(node = %pool.addr(), error = %e, "bucket checkout failed");
            return (indexes, BucketOutcome::NoConnection);
        }
    };

    match worker.pipeline(&commands).await {
        Ok(frames) => (indexes, BucketOutcome::Frames(frames)),
        Err(WorkerError::Closed) => (indexes, BucketOutcome::Closed),
        Err(WorkerError::Io(e)) => {
            debug!(node = %pool.addr(), error = %e, "bucket transport error");
            (indexes, BucketOutcome::NoConnection)
        }
        Err(WorkerError::Protocol(e)) => {
            (indexes, BucketOutcome::Fatal(ClusterError::Protocol(e)))
        }
        Err(WorkerError::Auth(msg)) => (indexes, BucketOutcome::Fatal(ClusterError::Server(msg))),
    }
}
