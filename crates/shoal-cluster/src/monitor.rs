//! Per-cluster topology monitor.
//!
//! The monitor is the single writer of the cluster snapshot. It runs as a
//! background task fed by a channel of refresh requests; each request
//! carries the version the requester observed, so a request raised
//! against a view the monitor already replaced is a no-op and concurrent
//! requests coalesce into one rebuild.
//!
//! Rebuilding bypasses the dispatcher entirely: the monitor opens a raw
//! worker connection to a candidate node and issues `CLUSTER SLOTS` on
//! it. Routing that query through the dispatcher would recurse into the
//! very machinery that is waiting for the rebuild.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shoal_pool::{NodeAddr, Pool, Worker, WorkerError};
use shoal_protocol::Frame;

use crate::config::ClusterConfig;
use crate::topology::{parse_cluster_slots, reconcile, Snapshot, SlotRange, TopologyError};

/// Handle to a running monitor task. Held by the cluster; dropping it
/// stops the task.
#[derive(Debug)]
pub(crate) struct MonitorHandle {
    snapshot_rx: watch::Receiver<Option<Arc<Snapshot>>>,
    refresh_tx: mpsc::UnboundedSender<u64>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Current snapshot, if one has ever been published.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_rx.borrow().clone()
    }

    /// Requests a rebuild of the snapshot the caller observed at
    /// `observed` (0 when the caller saw no snapshot at all). Stale
    /// requests are dropped by the monitor.
    pub fn request_refresh(&self, observed: u64) {
        // send only fails when the task is gone, i.e. at teardown
        let _ = self.refresh_tx.send(observed);
    }

    /// A receiver for waiting on the next snapshot publication.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_rx.clone()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns the monitor for one cluster, performing the initial slot-map
/// fetch inline. Failure to reach any init node still yields a running
/// monitor with no snapshot; requests will trigger further attempts.
pub(crate) async fn spawn(config: ClusterConfig) -> MonitorHandle {
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

    let mut monitor = Monitor {
        config,
        pools: HashMap::new(),
        version: 0,
        snapshot_tx,
    };
    monitor.rebuild().await;

    let task = tokio::spawn(monitor.run(refresh_rx));

    MonitorHandle {
        snapshot_rx,
        refresh_tx,
        task,
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("server refused CLUSTER SLOTS: {0}")]
    Refused(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("candidate did not answer in time")]
    TimedOut,
}

struct Monitor {
    config: ClusterConfig,
    /// Live pools keyed by address, reused across rebuilds so an
    /// unchanged topology keeps its warm connections.
    pools: HashMap<NodeAddr, Arc<Pool>>,
    version: u64,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl Monitor {
    async fn run(mut self, mut refresh_rx: mpsc::UnboundedReceiver<u64>) {
        while let Some(observed) = refresh_rx.recv().await {
            let mut wanted = observed >= self.version;
            // coalesce everything queued behind this request
            while let Ok(queued) = refresh_rx.try_recv() {
                if queued >= self.version {
                    wanted = true;
                }
            }
            if !wanted {
                debug!(
                    cluster = %self.config.name,
                    observed,
                    version = self.version,
                    "refresh request is stale, skipping"
                );
                continue;
            }
            self.rebuild().await;
        }
    }

    /// Tries each candidate node until one yields a usable slot map, then
    /// publishes the next snapshot. Exhausting all candidates keeps the
    /// previous snapshot in place.
    async fn rebuild(&mut self) {
        for addr in self.candidates() {
            match self.fetch_ranges(&addr).await {
                Ok(ranges) => {
                    self.publish(&ranges);
                    return;
                }
                Err(e) => {
                    warn!(
                        cluster = %self.config.name,
                        node = %addr,
                        error = %e,
                        "slot map fetch failed, trying next candidate"
                    );
                }
            }
        }
        warn!(
            cluster = %self.config.name,
            version = self.version,
            "slot map rebuild failed on every candidate, keeping previous map"
        );
    }

    /// Candidate nodes in preference order: the current map's nodes
    /// first (they are known-live), then the configured init nodes.
    fn candidates(&self) -> Vec<NodeAddr> {
        let mut out: Vec<NodeAddr> = Vec::with_capacity(self.pools.len() + self.config.nodes.len());
        if let Some(snapshot) = self.snapshot_tx.borrow().as_ref() {
            for pool in snapshot.pools() {
                out.push(pool.addr().clone());
            }
        }
        for addr in &self.config.nodes {
            if !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }

    /// Bounded by the checkout timeout so one black-holed candidate
    /// cannot stall the rebuild of the whole cluster.
    async fn fetch_ranges(&self, addr: &NodeAddr) -> Result<Vec<SlotRange>, FetchError> {
        match tokio::time::timeout(self.config.checkout_timeout, self.fetch_ranges_inner(addr))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::TimedOut),
        }
    }

    async fn fetch_ranges_inner(&self, addr: &NodeAddr) -> Result<Vec<SlotRange>, FetchError> {
        let mut worker = Worker::connect(addr, self.config.password.as_deref()).await?;
        let cmd = [Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")];
        match worker.query(&cmd).await? {
            Frame::Error(msg) => Err(FetchError::Refused(msg)),
            frame => Ok(parse_cluster_slots(&frame)?),
        }
    }

    fn publish(&mut self, ranges: &[SlotRange]) {
        let (snapshot, live, evicted) = reconcile(
            self.version + 1,
            ranges,
            &self.pools,
            &self.config.pool_options(),
        );
        self.version = snapshot.version();
        self.pools = live;
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));

        // recycle only after publication, so requests still routing on
        // the old snapshot drain their workers first
        for pool in &evicted {
            pool.recycle();
        }

        info!(
            cluster = %self.config.name,
            version = self.version,
            nodes = snapshot.pools().len(),
            evicted = evicted.len(),
            "slot map published"
        );
    }
}
