//! The cluster handle and its dispatch state machine.
//!
//! [`Cluster`] routes commands to the pool owning their slot and recovers
//! from stale topology. Every attempt classifies its outcome: a definitive
//! reply is returned, a routing signal (`MOVED`, `READONLY`,
//! `CLUSTERDOWN`, `TRYAGAIN`, checkout failure) requests a snapshot
//! refresh and retries, a closed connection retries without a refresh,
//! and anything else is terminal. The attempt budget is
//! `request_ttl`; between retries the dispatcher sleeps `retry_delay` to
//! throttle refresh storms.
//!
//! `MOVED` is deliberately handled by rebuilding the whole map instead of
//! following the redirect address: one extra round trip buys a cache that
//! never disagrees with per-slot redirects under concurrent migrations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{sleep, timeout};
use tracing::debug;

use shoal_pool::{Pool, PooledWorker, WorkerError};
use shoal_protocol::Frame;

use crate::command::{command_key, pipeline_key};
use crate::config::ClusterConfig;
use crate::error::{is_routing_error, ClusterError};
use crate::monitor::{self, MonitorHandle};
use crate::slot::key_slot;
use crate::topology::Snapshot;

/// A connected cluster: the snapshot monitor plus the dispatch machinery.
///
/// Cheap to share (`Arc`); all operations take `&self` and may run
/// concurrently. Dropping the last handle stops the monitor task.
#[derive(Debug)]
pub struct Cluster {
    config: ClusterConfig,
    monitor: MonitorHandle,
    /// Highest version a `reconnect_all` has been honored for.
    reconnect_version: AtomicU64,
}

/// What one attempt produced.
pub(crate) enum Attempt {
    Done(Reply),
    Fail(ClusterError),
    Again(Backoff),
}

/// How to pause before the next attempt.
pub(crate) enum Backoff {
    /// Request a rebuild of the observed snapshot version, then sleep.
    Refresh(u64),
    /// Plain sleep; the worker will reconnect by itself.
    Plain,
    /// No snapshot yet: request the initial build and wait for its
    /// publication instead of sleeping blind.
    AwaitSnapshot,
}

pub(crate) enum Reply {
    Single(Frame),
    Many(Vec<Frame>),
}

pub(crate) enum Request<'a> {
    Single(&'a [Bytes]),
    Pipeline(&'a [Vec<Bytes>]),
}

impl Cluster {
    /// Connects to a cluster: spawns its monitor and attempts the first
    /// slot-map fetch from the configured init nodes in order.
    ///
    /// Never fails outright — if no init node responds, the cluster
    /// starts without a topology and requests retry until their budget
    /// runs out (or a later refresh succeeds).
    pub async fn connect(config: ClusterConfig) -> Arc<Self> {
        let monitor = monitor::spawn(config.clone()).await;
        Arc::new(Self {
            config,
            monitor,
            reconnect_version: AtomicU64::new(0),
        })
    }

    /// The symbolic name of this cluster.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The current topology snapshot, if one has been published.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.monitor.snapshot()
    }

    /// Runs a single command, routed by its extracted key.
    pub async fn q(&self, command: &[Bytes]) -> Result<Frame, ClusterError> {
        let key = command_key(command)
            .ok_or(ClusterError::InvalidCommand)?
            .clone();
        self.qk(command, &key).await
    }

    /// Runs a single command routed by an explicit key, regardless of the
    /// command's own arguments.
    pub async fn qk(&self, command: &[Bytes], key: &[u8]) -> Result<Frame, ClusterError> {
        match self.run_routed(key, Request::Single(command)).await? {
            Reply::Single(frame) => Ok(frame),
            Reply::Many(_) => unreachable!("single command yields a single reply"),
        }
    }

    /// Runs a slot-affine pipeline, routed by its first command's key.
    /// Per-command server errors stay in the reply list.
    pub async fn q_pipeline(&self, commands: &[Vec<Bytes>]) -> Result<Vec<Frame>, ClusterError> {
        let key = pipeline_key(commands)
            .ok_or(ClusterError::InvalidCommand)?
            .clone();
        self.qk_pipeline(commands, &key).await
    }

    /// Runs a pipeline routed by an explicit key.
    pub async fn qk_pipeline(
        &self,
        commands: &[Vec<Bytes>],
        key: &[u8],
    ) -> Result<Vec<Frame>, ClusterError> {
        match self.run_routed(key, Request::Pipeline(commands)).await? {
            Reply::Many(frames) => Ok(frames),
            Reply::Single(_) => unreachable!("pipeline yields a reply list"),
        }
    }

    /// Wraps the commands in `MULTI` … `EXEC` on one node and returns the
    /// final `EXEC` reply (an array of per-command results, or null when
    /// a watched key invalidated the transaction).
    ///
    /// The caller is responsible for slot affinity: routing trusts the
    /// first command's key, and commands hashing elsewhere will be
    /// rejected by the server.
    pub async fn transaction(&self, commands: &[Vec<Bytes>]) -> Result<Frame, ClusterError> {
        let mut wrapped = Vec::with_capacity(commands.len() + 2);
        wrapped.push(vec![Bytes::from_static(b"MULTI")]);
        wrapped.extend_from_slice(commands);
        wrapped.push(vec![Bytes::from_static(b"EXEC")]);

        let key = pipeline_key(&wrapped)
            .ok_or(ClusterError::InvalidCommand)?
            .clone();
        let replies = self.qk_pipeline(&wrapped, &key).await?;
        Ok(replies.into_iter().next_back().unwrap_or(Frame::Null))
    }

    /// Checks a worker out of the pool owning `key`'s slot, for flows
    /// that must pin one connection (`WATCH` … `MULTI` … `EXEC`).
    ///
    /// The checkout itself goes through the retry/refresh machinery;
    /// commands issued on the returned worker do not — a transport
    /// failure poisons the worker and surfaces to the caller.
    pub async fn worker_for(&self, key: &[u8]) -> Result<PooledWorker, ClusterError> {
        let slot = key_slot(key);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let again = match self.monitor.snapshot() {
                None => Backoff::AwaitSnapshot,
                Some(snapshot) => {
                    let version = snapshot.version();
                    match snapshot.pool_for_slot(slot) {
                        None => Backoff::Refresh(version),
                        Some(pool) => match pool.acquire().await {
                            Ok(worker) => return Ok(worker),
                            Err(e) => {
                                debug!(node = %pool.addr(), error = %e, "checkout failed");
                                Backoff::Refresh(version)
                            }
                        },
                    }
                }
            };
            if attempt >= self.config.request_ttl {
                return Err(ClusterError::NoConnection(self.config.name.clone()));
            }
            self.backoff(again).await;
        }
    }

    /// Best-effort recycling of every pool of this cluster, e.g. after a
    /// credential rotation. Concurrent calls observing the same snapshot
    /// version coalesce into one recycle.
    pub fn reconnect_all(&self, observed_version: u64) {
        let previous = self
            .reconnect_version
            .fetch_max(observed_version, Ordering::AcqRel);
        if previous >= observed_version {
            return;
        }
        if let Some(snapshot) = self.monitor.snapshot() {
            for pool in snapshot.pools() {
                pool.recycle();
            }
        }
    }

    // -- dispatch machinery --

    pub(crate) fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    pub(crate) fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub(crate) async fn run_routed(
        &self,
        key: &[u8],
        request: Request<'_>,
    ) -> Result<Reply, ClusterError> {
        let slot = key_slot(key);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_slot(slot, &request).await {
                Attempt::Done(reply) => return Ok(reply),
                Attempt::Fail(err) => return Err(err),
                Attempt::Again(again) => {
                    if attempt >= self.config.request_ttl {
                        debug!(
                            cluster = %self.config.name,
                            attempts = attempt,
                            "request budget exhausted"
                        );
                        return Err(ClusterError::NoConnection(self.config.name.clone()));
                    }
                    self.backoff(again).await;
                }
            }
        }
    }

    async fn attempt_slot(&self, slot: u16, request: &Request<'_>) -> Attempt {
        let Some(snapshot) = self.monitor.snapshot() else {
            return Attempt::Again(Backoff::AwaitSnapshot);
        };
        let version = snapshot.version();
        let Some(pool) = snapshot.pool_for_slot(slot) else {
            debug!(slot, version, "slot unassigned in current map");
            return Attempt::Again(Backoff::Refresh(version));
        };
        self.run_on_pool(pool, request, version).await
    }

    async fn run_on_pool(
        &self,
        pool: &Arc<Pool>,
        request: &Request<'_>,
        version: u64,
    ) -> Attempt {
        let mut worker = match pool.acquire().await {
            Ok(worker) => worker,
            Err(e) => {
                debug!(node = %pool.addr(), error = %e, "checkout failed");
                return Attempt::Again(Backoff::Refresh(version));
            }
        };

        match request {
            Request::Single(command) => match worker.query(command).await {
                Ok(Frame::Error(msg)) if is_routing_error(&msg) => {
                    debug!(node = %pool.addr(), error = %msg, "routing error");
                    Attempt::Again(Backoff::Refresh(version))
                }
                Ok(Frame::Error(msg)) => Attempt::Fail(ClusterError::Server(msg)),
                Ok(frame) => Attempt::Done(Reply::Single(frame)),
                Err(e) => classify_transport(pool, e, version),
            },
            Request::Pipeline(commands) => match worker.pipeline(commands).await {
                Ok(frames) => {
                    if let Some(msg) = routing_error_in(&frames) {
                        debug!(node = %pool.addr(), error = %msg, "routing error in pipeline");
                        Attempt::Again(Backoff::Refresh(version))
                    } else {
                        Attempt::Done(Reply::Many(frames))
                    }
                }
                Err(e) => classify_transport(pool, e, version),
            },
        }
    }

    pub(crate) async fn backoff(&self, again: Backoff) {
        match again {
            Backoff::Refresh(observed) => {
                self.monitor.request_refresh(observed);
                sleep(self.config.retry_delay).await;
            }
            Backoff::Plain => sleep(self.config.retry_delay).await,
            Backoff::AwaitSnapshot => {
                self.monitor.request_refresh(0);
                self.await_snapshot().await;
            }
        }
    }

    /// Waits for the next snapshot publication, bounded by `retry_delay`
    /// so a dead cluster still burns through the attempt budget.
    async fn await_snapshot(&self) {
        let mut rx = self.monitor.subscribe();
        if rx.borrow_and_update().is_some() {
            return;
        }
        let _ = timeout(self.config.retry_delay, rx.changed()).await;
    }
}

/// Finds the first routing-class error in a reply list, the signal that
/// the whole pipeline must be replayed against a fresh map.
pub(crate) fn routing_error_in(frames: &[Frame]) -> Option<&str> {
    frames
        .iter()
        .filter_map(|frame| frame.as_error())
        .find(|msg| is_routing_error(msg))
}

pub(crate) fn classify_transport(pool: &Arc<Pool>, err: WorkerError, version: u64) -> Attempt {
    match err {
        // the pool reconnects lazily; the map is probably still right
        WorkerError::Closed => {
            debug!(node = %pool.addr(), "connection closed, retrying without refresh");
            Attempt::Again(Backoff::Plain)
        }
        WorkerError::Io(e) => {
            debug!(node = %pool.addr(), error = %e, "transport error");
            Attempt::Again(Backoff::Refresh(version))
        }
        WorkerError::Protocol(e) => Attempt::Fail(ClusterError::Protocol(e)),
        WorkerError::Auth(msg) => Attempt::Fail(ClusterError::Server(msg)),
    }
}
