//! Regular Process Scheduler
//!
//! A single background task that wakes on a fixed tick and runs every
//! registered process that reports itself due. Reconnection of ejected
//! members is the built-in process; applications may register their own.

mod reconnect;

pub use reconnect::ReconnectProcess;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::cluster::{ClusterInner, DatabaseCluster};
use crate::error::{Error, Result};

/// Periodic maintenance run by the cluster scheduler
#[async_trait]
pub trait RegularProcess: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Whether the process should run on this tick
    fn is_due(&self) -> bool;

    /// Run one pass against the cluster
    async fn run(&self, cluster: &DatabaseCluster) -> Result<()>;

    /// Called with the error of a failed run
    fn on_error(&self, error: &Error) {
        tracing::warn!("Regular process {} failed: {}", self.name(), error);
    }
}

/// Shared handle to a regular process
pub type ProcessRef = Arc<dyn RegularProcess>;

pub(crate) struct Scheduler {
    processes: RwLock<Vec<ProcessRef>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub(crate) fn new(processes: Vec<ProcessRef>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            processes: RwLock::new(processes),
            shutdown,
        }
    }

    pub(crate) async fn register(&self, process: ProcessRef) {
        tracing::info!("Registered regular process {}", process.name());
        self.processes.write().await.push(process);
    }

    /// Unregister a process by handle; returns whether it was registered
    pub(crate) async fn unregister(&self, process: &ProcessRef) -> bool {
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|p| !Arc::ptr_eq(p, process));
        let removed = processes.len() != before;
        if removed {
            tracing::info!("Unregistered regular process {}", process.name());
        }
        removed
    }

    pub(crate) async fn process_names(&self) -> Vec<String> {
        self.processes
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Start the tick loop. It holds the cluster weakly and ends when the
    /// cluster is dropped or `stop` is called.
    pub(crate) fn start(&self, cluster: Weak<ClusterInner>, tick: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, regular processes will not run");
            return;
        };
        let mut shutdown = self.shutdown.subscribe();

        runtime.spawn(async move {
            tracing::debug!("Scheduler started, tick {:?}", tick);
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                let Some(inner) = cluster.upgrade() else {
                    break;
                };
                let cluster = DatabaseCluster::from_inner(inner);
                cluster.scheduler().run_due(&cluster).await;
            }
            tracing::debug!("Scheduler stopped");
        });
    }

    /// Run every due process once, in registration order
    pub(crate) async fn run_due(&self, cluster: &DatabaseCluster) {
        let processes: Vec<ProcessRef> = self.processes.read().await.clone();
        for process in processes {
            if *self.shutdown.borrow() {
                return;
            }
            if !process.is_due() {
                continue;
            }
            tracing::trace!("Running regular process {}", process.name());
            if let Err(e) = process.run(cluster).await {
                process.on_error(&e);
            }
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
