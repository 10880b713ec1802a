//! Named cluster registry.
//!
//! Multiple independent clusters coexist in one process, each under a
//! unique symbolic name. The registry owns the name → cluster map and
//! mirrors the dispatcher surface keyed by name, so call sites don't
//! need to thread cluster handles around.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use shoal_protocol::Frame;

use crate::client::Cluster;
use crate::config::ClusterConfig;
use crate::error::ClusterError;

/// Name-keyed collection of connected clusters.
#[derive(Default)]
pub struct Registry {
    clusters: DashMap<String, Arc<Cluster>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a cluster under its configured name.
    ///
    /// Succeeds even when no init node responds — the cluster starts
    /// cold and discovers its topology on first use or a later refresh.
    pub async fn connect(&self, config: ClusterConfig) -> Result<Arc<Cluster>, ClusterError> {
        let name = config.name.clone();
        if self.clusters.contains_key(&name) {
            return Err(ClusterError::DuplicateCluster(name));
        }

        let cluster = Cluster::connect(config).await;

        match self.clusters.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // raced with a concurrent connect under the same name;
                // the loser's monitor stops when its handle drops
                Err(ClusterError::DuplicateCluster(name))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&cluster));
                Ok(cluster)
            }
        }
    }

    /// Looks up a connected cluster by name.
    pub fn get(&self, name: &str) -> Result<Arc<Cluster>, ClusterError> {
        self.clusters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClusterError::UnknownCluster(name.to_owned()))
    }

    /// Removes a cluster from the registry. Its monitor stops once the
    /// last outstanding handle drops.
    pub fn disconnect(&self, name: &str) -> Result<(), ClusterError> {
        self.clusters
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::UnknownCluster(name.to_owned()))
    }

    // -- name-keyed dispatcher surface --

    pub async fn q(&self, cluster: &str, command: &[Bytes]) -> Result<Frame, ClusterError> {
        self.get(cluster)?.q(command).await
    }

    pub async fn qk(
        &self,
        cluster: &str,
        command: &[Bytes],
        key: &[u8],
    ) -> Result<Frame, ClusterError> {
        self.get(cluster)?.qk(command, key).await
    }

    pub async fn q_pipeline(
        &self,
        cluster: &str,
        commands: &[Vec<Bytes>],
    ) -> Result<Vec<Frame>, ClusterError> {
        self.get(cluster)?.q_pipeline(commands).await
    }

    pub async fn qmn(
        &self,
        cluster: &str,
        commands: &[Vec<Bytes>],
    ) -> Result<Vec<Frame>, ClusterError> {
        self.get(cluster)?.qmn(commands).await
    }

    pub async fn qa(&self, cluster: &str, command: &[Bytes]) -> Result<Vec<Frame>, ClusterError> {
        self.get(cluster)?.qa(command).await
    }

    pub async fn transaction(
        &self,
        cluster: &str,
        commands: &[Vec<Bytes>],
    ) -> Result<Frame, ClusterError> {
        self.get(cluster)?.transaction(commands).await
    }

    pub async fn flushdb(&self, cluster: &str) -> Result<(), ClusterError> {
        self.get(cluster)?.flushdb().await
    }

    pub async fn eval(
        &self,
        cluster: &str,
        script: &[u8],
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<Frame, ClusterError> {
        self.get(cluster)?.eval(script, keys, args).await
    }
}
