//! Bounded worker pool for one cluster node.
//!
//! Capacity is `size + max_overflow` concurrent workers, enforced by a
//! semaphore. Up to `size` idle connections are kept for reuse; overflow
//! workers are closed on release. Connections are established lazily at
//! checkout, so building a pool performs no I/O — the topology monitor can
//! assemble a full snapshot of pools before any request runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::addr::NodeAddr;
use crate::error::PoolError;
use crate::worker::Worker;

/// Tuning for one pool. Defaults follow the classic client family:
/// a small baseline with room to double-digit overflow under bursts.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Baseline worker count kept alive for reuse.
    pub size: usize,
    /// Additional workers the pool may grow to under load.
    pub max_overflow: usize,
    /// Password sent via `AUTH` on every fresh connection.
    pub password: Option<String>,
    /// How long a checkout may wait for capacity before failing.
    pub checkout_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 5,
            max_overflow: 10,
            password: None,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

/// Bounded pool of workers for one node.
#[derive(Debug)]
pub struct Pool {
    addr: NodeAddr,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
    /// Bumped by [`recycle`]; workers checked out under an older
    /// generation are dropped on release instead of returned.
    ///
    /// [`recycle`]: Pool::recycle
    generation: AtomicU64,
}

impl Pool {
    /// Creates a pool for `addr`. No connection is made until the first
    /// checkout.
    pub fn new(addr: NodeAddr, options: PoolOptions) -> Arc<Self> {
        let capacity = options.size + options.max_overflow;
        Arc::new(Self {
            addr,
            options,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// The node this pool connects to.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Number of idle workers currently held.
    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Checks a worker out of the pool, connecting lazily if no idle
    /// worker is available.
    ///
    /// Fails with [`PoolError::Exhausted`] when capacity (or a hanging
    /// lazy connect) keeps the checkout past its timeout — callers must
    /// not block indefinitely on a saturated or unresponsive node.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledWorker, PoolError> {
        match timeout(self.options.checkout_timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Exhausted {
                addr: self.addr.clone(),
            }),
        }
    }

    async fn checkout(self: &Arc<Self>) -> Result<PooledWorker, PoolError> {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            // acquire_owned only errors if the semaphore is closed,
            // which this pool never does
            Err(_) => {
                return Err(PoolError::Exhausted {
                    addr: self.addr.clone(),
                })
            }
        };

        let generation = self.generation.load(Ordering::Acquire);

        let idle_worker = self.lock_idle().pop();
        let worker = match idle_worker {
            Some(worker) => worker,
            None => {
                trace!(addr = %self.addr, "pool connecting new worker");
                Worker::connect(&self.addr, self.options.password.as_deref())
                    .await
                    .map_err(|source| PoolError::Connect {
                        addr: self.addr.clone(),
                        source,
                    })?
            }
        };

        Ok(PooledWorker {
            worker: Some(worker),
            pool: Arc::clone(self),
            generation,
            _permit: permit,
        })
    }

    /// Drops all idle workers and marks every checked-out worker for
    /// discard on release. The next checkouts reconnect from scratch.
    pub fn recycle(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = {
            let mut idle = self.lock_idle();
            let n = idle.len();
            idle.clear();
            n
        };
        debug!(addr = %self.addr, dropped, "pool recycled");
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Worker>> {
        // a panic while holding the lock leaves only a Vec of workers,
        // which is safe to keep using
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, worker: Worker, generation: u64) {
        if worker.is_dead() {
            trace!(addr = %self.addr, "discarding dead worker");
            return;
        }
        if generation != self.generation.load(Ordering::Acquire) {
            trace!(addr = %self.addr, "discarding recycled worker");
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() < self.options.size {
            idle.push(worker);
        }
        // overflow worker: dropped, closing the connection
    }
}

/// A worker checked out of a [`Pool`].
///
/// Dereferences to [`Worker`]. Dropping the guard returns the worker to
/// the pool (or discards it if it died or the pool was recycled), so a
/// panicking caller cannot leak pool capacity.
#[derive(Debug)]
pub struct PooledWorker {
    worker: Option<Worker>,
    pool: Arc<Pool>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledWorker {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        self.worker.as_ref().expect("worker present until drop")
    }
}

impl std::ops::DerefMut for PooledWorker {
    fn deref_mut(&mut self) -> &mut Worker {
        self.worker.as_mut().expect("worker present until drop")
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker, self.generation);
        }
    }
}
