//! Database Cluster
//!
//! Presents a set of backends as one logical database. Writes are applied
//! to every ready member, reads go to one of them, and members that fail
//! are ejected and later brought back by the scheduler.

mod registry;
mod router;
mod sync;

pub use registry::{ClusterSummary, MemberStatus};
pub use sync::SyncReport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::action::{Mutation, Query, Row, WriteAction};
use crate::backend::{BackendId, BackendRef, MariaDbBackend};
use crate::config::{ClusterConfig, WolfClusterConfig};
use crate::error::{Error, Result};
use crate::scheduler::{ProcessRef, ReconnectProcess, Scheduler};
use crate::schema::TableSchema;

use registry::MemberRegistry;
use router::ExecutionRouter;
use sync::Synchronizer;

/// Runtime options of a cluster
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Cluster name, used in logs
    pub name: String,
    /// Maximum number of write replication tasks running at once
    pub max_parallel_writes: usize,
    pub scheduler_tick: Duration,
    /// Interval between reconnection attempts for ejected members
    pub reconnect_interval: Duration,
    /// Tables that can never be dropped; every required table when `None`
    pub protected_tables: Option<Vec<String>>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::from(&ClusterConfig::default())
    }
}

impl From<&ClusterConfig> for ClusterOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_parallel_writes: config.max_parallel_writes,
            scheduler_tick: config.scheduler_tick(),
            reconnect_interval: config.reconnect_interval(),
            protected_tables: config.protected_tables.clone(),
        }
    }
}

/// Snapshot of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: BackendId,
    pub status: MemberStatus,
    /// Writes queued and not yet applied
    pub queued_writes: usize,
    pub added_at: chrono::DateTime<chrono::Utc>,
}

pub(crate) struct ClusterInner {
    name: String,
    registry: MemberRegistry,
    tables: Vec<TableSchema>,
    protected_tables: HashSet<String>,
    permits: Arc<Semaphore>,
    scheduler: Scheduler,
    shutdown: AtomicBool,
}

/// A cluster of backends kept in sync.
///
/// Cheap to clone; every clone drives the same cluster.
#[derive(Clone)]
pub struct DatabaseCluster {
    inner: Arc<ClusterInner>,
}

impl DatabaseCluster {
    /// Create an empty cluster that keeps `tables` on every member
    pub fn new(tables: Vec<TableSchema>, options: ClusterOptions) -> Self {
        let protected_tables = options
            .protected_tables
            .unwrap_or_else(|| tables.iter().map(|t| t.name.clone()).collect())
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        let reconnect: ProcessRef = Arc::new(ReconnectProcess::new(options.reconnect_interval));

        let inner = Arc::new(ClusterInner {
            name: options.name,
            registry: MemberRegistry::new(),
            tables,
            protected_tables,
            permits: Arc::new(Semaphore::new(options.max_parallel_writes.max(1))),
            scheduler: Scheduler::new(vec![reconnect]),
            shutdown: AtomicBool::new(false),
        });
        inner
            .scheduler
            .start(Arc::downgrade(&inner), options.scheduler_tick);

        tracing::info!(
            "Cluster {} created with {} required tables",
            inner.name,
            inner.tables.len()
        );
        Self { inner }
    }

    /// Connect every configured database and add it to a new cluster.
    ///
    /// The first reachable database seeds the cluster; unreachable ones
    /// are logged and left out.
    pub async fn from_config(config: &WolfClusterConfig) -> Result<Self> {
        let mut options = ClusterOptions::from(&config.cluster);
        options.protected_tables = Some(config.protected_tables());
        let cluster = Self::new(config.tables.clone(), options);

        for db in &config.databases {
            let backend: BackendRef = match MariaDbBackend::connect(db).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", db.identity(), e);
                    continue;
                }
            };

            if cluster.cluster_size().await == 0 {
                cluster.add_database_and_wait(backend).await?;
            } else if let Err(e) = cluster.add_database(backend).await {
                tracing::warn!("Failed to add {}: {}", db.identity(), e);
            }
        }

        if cluster.cluster_size().await == 0 {
            cluster.shutdown().await;
            return Err(Error::NoAvailableBackend);
        }
        Ok(cluster)
    }

    pub(crate) fn from_inner(inner: Arc<ClusterInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Tables every member must carry
    pub fn tables(&self) -> &[TableSchema] {
        &self.inner.tables
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn router(&self) -> ExecutionRouter<'_> {
        ExecutionRouter::new(
            &self.inner.registry,
            &self.inner.permits,
            &self.inner.protected_tables,
        )
    }

    async fn synchronize(&self, id: &BackendId, on_failure: MemberStatus) -> Result<SyncReport> {
        Synchronizer::new(&self.inner.registry, &self.inner.tables)
            .synchronize(id, on_failure)
            .await
    }

    /// Add a backend and synchronize it.
    ///
    /// Synchronization runs in the background once at least two members
    /// are ready, on the same bounded pool as write replication; until
    /// then it runs before returning. Returns whether the
    /// backend was new. Adding a known backend retries its synchronization
    /// if it is unsynchronised or ejected.
    pub async fn add_database(&self, backend: BackendRef) -> Result<bool> {
        self.ensure_running()?;
        let id = backend.id().clone();
        let added = self.inner.registry.add(backend).await;

        if self.cluster_size().await < 2 {
            self.synchronize(&id, MemberStatus::Unsynchronised).await?;
            return Ok(added);
        }

        let cluster = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&cluster.inner.permits).acquire_owned().await else {
                tracing::debug!("Cluster shut down before {} was synchronized", id);
                return;
            };
            if cluster.is_shutdown() {
                return;
            }
            if let Err(e) = cluster.synchronize(&id, MemberStatus::Ejected).await {
                tracing::warn!("Background synchronization of {} failed: {}", id, e);
            }
        });
        Ok(added)
    }

    /// Add a backend and synchronize it before returning
    pub async fn add_database_and_wait(&self, backend: BackendRef) -> Result<bool> {
        self.ensure_running()?;
        let id = backend.id().clone();
        let added = self.inner.registry.add(backend).await;
        self.synchronize(&id, MemberStatus::Unsynchronised).await?;
        Ok(added)
    }

    /// Synchronize a known member now, returning what was done
    pub async fn synchronize_database(&self, id: &BackendId) -> Result<SyncReport> {
        self.ensure_running()?;
        self.synchronize(id, MemberStatus::Unsynchronised).await
    }

    /// Remove a member and close its backend. The last member cannot be removed.
    pub async fn remove_database(&self, id: &BackendId) -> Result<()> {
        let member = self.inner.registry.member(id).await?;
        let backend = self.inner.registry.remove(id).await?;

        // Let an in-flight operation finish first
        let _guard = member.lock().await;
        backend.close().await;
        Ok(())
    }

    /// Force a member out of routing. The last ready member cannot be ejected.
    pub async fn eject_database(&self, id: &BackendId) -> Result<bool> {
        self.inner.registry.eject(id).await
    }

    /// Take a member out of routing until resumed
    pub async fn pause_database(&self, id: &BackendId) -> Result<bool> {
        self.inner.registry.pause(id).await
    }

    /// Resume a paused member and synchronize it back in
    pub async fn resume_database(&self, id: &BackendId) -> Result<bool> {
        self.ensure_running()?;
        if !self.inner.registry.resume(id).await? {
            return Ok(false);
        }
        let backend = Arc::clone(self.inner.registry.member(id).await?.backend());
        self.add_database(backend).await?;
        Ok(true)
    }

    /// Permanently take a member out of routing; it is never reconnected
    pub async fn retire_database(&self, id: &BackendId) -> Result<bool> {
        self.inner.registry.retire(id).await
    }

    /// Status of a backend; `Unknown` if it is not a member
    pub async fn status(&self, id: &BackendId) -> MemberStatus {
        match self.inner.registry.get(id).await {
            Some(member) => member.status(),
            None => MemberStatus::Unknown,
        }
    }

    /// Number of ready members
    pub async fn cluster_size(&self) -> usize {
        self.inner.registry.ready_count().await
    }

    /// Writes queued on a member and not yet applied
    pub async fn queued_writes(&self, id: &BackendId) -> usize {
        self.inner
            .registry
            .get(id)
            .await
            .map_or(0, |m| m.queue_len())
    }

    pub async fn summary(&self) -> ClusterSummary {
        self.inner.registry.summary().await
    }

    /// Every member, oldest first
    pub async fn members(&self) -> Vec<MemberInfo> {
        self.inner
            .registry
            .all_members()
            .await
            .into_iter()
            .map(|m| MemberInfo {
                id: m.id().clone(),
                status: m.status(),
                queued_writes: m.queue_len(),
                added_at: m.added_at(),
            })
            .collect()
    }

    /// Backends of the ready members
    pub async fn ready_backends(&self) -> Vec<BackendRef> {
        backends(self.inner.registry.ready_members().await)
    }

    /// Backends of the members waiting for synchronization
    pub async fn unsynchronised_backends(&self) -> Vec<BackendRef> {
        backends(self.inner.registry.unsynchronised_members().await)
    }

    /// Backends of the ejected members
    pub async fn ejected_backends(&self) -> Vec<BackendRef> {
        backends(self.inner.registry.ejected_members().await)
    }

    /// Run a read on one ready member
    pub async fn execute_query(&self, query: &Query) -> Result<Vec<Row>> {
        self.ensure_running()?;
        self.router().execute_query(query).await
    }

    /// Apply a write to the whole cluster, returning the mutations applied
    pub async fn execute_write(&self, action: &WriteAction) -> Result<Vec<Mutation>> {
        self.ensure_running()?;
        self.router().execute_write(action).await
    }

    pub async fn register_regular_process(&self, process: ProcessRef) {
        self.inner.scheduler.register(process).await;
    }

    pub async fn unregister_regular_process(&self, process: &ProcessRef) -> bool {
        self.inner.scheduler.unregister(process).await
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the scheduler and the write workers, then close every backend
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down cluster {}", self.inner.name);

        self.inner.scheduler.stop();
        self.inner.permits.close();
        for member in self.inner.registry.all_members().await {
            member.backend().close().await;
        }
        tracing::info!("Cluster {} shut down", self.inner.name);
    }
}

fn backends(members: Vec<Arc<registry::Member>>) -> Vec<BackendRef> {
    members.iter().map(|m| Arc::clone(m.backend())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_status_of_stranger_is_unknown() {
        let cluster = DatabaseCluster::new(vec![], ClusterOptions::default());
        assert_eq!(cluster.status(&"nobody".into()).await, MemberStatus::Unknown);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_backends() {
        let cluster = DatabaseCluster::new(vec![], ClusterOptions::default());
        let a = Arc::new(MemoryBackend::new("a"));
        assert!(cluster.add_database(a.clone()).await.unwrap());

        cluster.shutdown().await;
        assert!(cluster.is_shutdown());
        assert!(a.is_closed());
        assert!(matches!(
            cluster.execute_query(&Query::scan("t")).await,
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            cluster.add_database(Arc::new(MemoryBackend::new("b"))).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let cluster = DatabaseCluster::new(vec![], ClusterOptions::default());
        for id in ["a", "b"] {
            cluster
                .add_database_and_wait(Arc::new(MemoryBackend::new(id)))
                .await
                .unwrap();
        }
        let a: BackendId = "a".into();

        assert!(cluster.pause_database(&a).await.unwrap());
        assert_eq!(cluster.status(&a).await, MemberStatus::Paused);
        assert!(matches!(
            cluster.pause_database(&"b".into()).await,
            Err(Error::CannotRemoveLastMember)
        ));

        // One ready member left, so the resync runs before returning
        assert!(cluster.resume_database(&a).await.unwrap());
        assert_eq!(cluster.status(&a).await, MemberStatus::Ready);
        assert_eq!(cluster.summary().await.ready, 2);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_sync_stops_at_shutdown() {
        let cluster = DatabaseCluster::new(vec![], ClusterOptions::default());
        for id in ["a", "b"] {
            cluster
                .add_database_and_wait(Arc::new(MemoryBackend::new(id)))
                .await
                .unwrap();
        }

        let c = Arc::new(MemoryBackend::new("c"));
        assert!(cluster.add_database(c.clone()).await.unwrap());
        cluster.shutdown().await;
        tokio::task::yield_now().await;

        assert_eq!(cluster.status(&"c".into()).await, MemberStatus::Unsynchronised);
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn test_members_snapshot() {
        let cluster = DatabaseCluster::new(vec![], ClusterOptions::default());
        cluster
            .add_database_and_wait(Arc::new(MemoryBackend::new("a")))
            .await
            .unwrap();
        cluster
            .add_database_and_wait(Arc::new(MemoryBackend::new("b")))
            .await
            .unwrap();
        assert!(cluster.retire_database(&"b".into()).await.unwrap());

        let members = cluster.members().await;
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].status, MemberStatus::Ready);
        assert_eq!(members[1].status, MemberStatus::Dead);
        assert_eq!(cluster.ready_backends().await.len(), 1);
        cluster.shutdown().await;
    }
}
