//! Optimistic locking over WATCH/MULTI/EXEC.
//!
//! The whole sequence runs on one checked-out worker so the server
//! associates the `WATCH` with the transaction that follows. A null
//! `EXEC` reply means the watched key changed underneath the caller;
//! the round is replayed with a freshly read value, bounded by
//! `cas_attempts`. This budget covers contention only — it is separate
//! from the routing retry budget, which governs the worker checkout.

use bytes::Bytes;
use tracing::debug;

use shoal_pool::{PooledWorker, WorkerError};
use shoal_protocol::Frame;

use crate::client::Cluster;
use crate::error::{is_routing_error, ClusterError};

enum CasRound<T> {
    /// EXEC committed; carries its reply and the closure's extra value.
    Done(Frame, T),
    /// EXEC returned null: the watched key changed.
    Contended,
    /// A routing-class error interrupted the round; refresh and replay.
    Stale,
    Fail(ClusterError),
}

impl Cluster {
    /// Runs a compare-and-set transaction on `key`.
    ///
    /// Each round: `WATCH key`, run the `read` command, hand its reply to
    /// `apply`, which returns the write pipeline and a value to carry
    /// out; then `MULTI`, the pipeline, `EXEC`. On success returns the
    /// `EXEC` reply and the carried value. Rounds lost to contention are
    /// retried up to `cas_attempts` times before surfacing
    /// [`ClusterError::ResourceBusy`].
    pub async fn optimistic_locking<T, F>(
        &self,
        key: &[u8],
        read: &[Bytes],
        mut apply: F,
    ) -> Result<(Frame, T), ClusterError>
    where
        F: FnMut(Frame) -> (Vec<Vec<Bytes>>, T),
    {
        let mut round = 0u32;
        while round < self.config().cas_attempts {
            round += 1;

            let mut worker = self.worker_for(key).await?;
            match self.cas_round(&mut worker, key, read, &mut apply).await {
                Ok(CasRound::Done(exec, extra)) => return Ok((exec, extra)),
                Ok(CasRound::Contended) => {
                    debug!(round, "watched key changed, retrying");
                }
                Ok(CasRound::Stale) => {
                    let observed = self.snapshot().map(|s| s.version()).unwrap_or(0);
                    self.monitor().request_refresh(observed);
                }
                Ok(CasRound::Fail(e)) => return Err(e),
                Err(e) => {
                    // worker is poisoned and will be discarded on release
                    debug!(round, error = %e, "transport failure during locking round");
                }
            }
        }
        Err(ClusterError::ResourceBusy)
    }

    async fn cas_round<T>(
        &self,
        worker: &mut PooledWorker,
        key: &[u8],
        read: &[Bytes],
        apply: &mut impl FnMut(Frame) -> (Vec<Vec<Bytes>>, T),
    ) -> Result<CasRound<T>, WorkerError> {
        let watch = [Bytes::from_static(b"WATCH"), Bytes::copy_from_slice(key)];
        match worker.query(&watch).await? {
            frame if frame.is_ok() => {}
            Frame::Error(msg) if is_routing_error(&msg) => return Ok(CasRound::Stale),
            Frame::Error(msg) => return Ok(CasRound::Fail(ClusterError::Server(msg))),
            other => {
                return Ok(CasRound::Fail(ClusterError::Server(format!(
                    "unexpected WATCH reply: {other:?}"
                ))))
            }
        }

        let outcome = self.cas_body(worker, read, apply).await;

        // any exit that didn't reach EXEC leaves the watch armed on a
        // worker about to rejoin the pool; clear it
        if matches!(&outcome, Ok(CasRound::Stale) | Ok(CasRound::Fail(_))) {
            let unwatch = [Bytes::from_static(b"UNWATCH")];
            let _ = worker.query(&unwatch).await;
        }
        outcome
    }

    async fn cas_body<T>(
        &self,
        worker: &mut PooledWorker,
        read: &[Bytes],
        apply: &mut impl FnMut(Frame) -> (Vec<Vec<Bytes>>, T),
    ) -> Result<CasRound<T>, WorkerError> {
        let value = match worker.query(read).await? {
            Frame::Error(msg) if is_routing_error(&msg) => return Ok(CasRound::Stale),
            Frame::Error(msg) => return Ok(CasRound::Fail(ClusterError::Server(msg))),
            frame => frame,
        };

        let (pipeline, extra) = apply(value);

        let mut batch = Vec::with_capacity(pipeline.len() + 2);
        batch.push(vec![Bytes::from_static(b"MULTI")]);
        batch.extend(pipeline);
        batch.push(vec![Bytes::from_static(b"EXEC")]);

        let replies = worker.pipeline(&batch).await?;
        match replies.into_iter().next_back() {
            Some(Frame::Null) | None => Ok(CasRound::Contended),
            Some(Frame::Error(msg)) if is_routing_error(&msg) => Ok(CasRound::Stale),
            Some(Frame::Error(msg)) => Ok(CasRound::Fail(ClusterError::Server(msg))),
            Some(exec) => Ok(CasRound::Done(exec, extra)),
        }
    }

    /// Reads `key`, applies `f` to its value, and writes the result back
    /// under optimistic locking. Returns the written value.
    pub async fn update_key<F>(&self, key: &[u8], mut f: F) -> Result<Bytes, ClusterError>
    where
        F: FnMut(Frame) -> Bytes,
    {
        let key_token = Bytes::copy_from_slice(key);
        let read = vec![Bytes::from_static(b"GET"), key_token.clone()];

        let (_exec, written) = self
            .optimistic_locking(key, &read, |value| {
                let next = f(value);
                let write = vec![vec![
                    Bytes::from_static(b"SET"),
                    key_token.clone(),
                    next.clone(),
                ]];
                (write, next)
            })
            .await?;
        Ok(written)
    }

    /// Reads one hash field, applies `f`, and writes the result back
    /// under optimistic locking on the hash key. Returns the written
    /// value.
    pub async fn update_hash_field<F>(
        &self,
        key: &[u8],
        field: &[u8],
        mut f: F,
    ) -> Result<Bytes, ClusterError>
    where
        F: FnMut(Frame) -> Bytes,
    {
        let key_token = Bytes::copy_from_slice(key);
        let field_token = Bytes::copy_from_slice(field);
        let read = vec![
            Bytes::from_static(b"HGET"),
            key_token.clone(),
            field_token.clone(),
        ];

        let (_exec, written) = self
            .optimistic_locking(key, &read, |value| {
                let next = f(value);
                let write = vec![vec![
                    Bytes::from_static(b"HSET"),
                    key_token.clone(),
                    field_token.clone(),
                    next.clone(),
                ]];
                (write, next)
            })
            .await?;
        Ok(written)
    }
}
