//! Reconnection of ejected members

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::RegularProcess;
use crate::cluster::DatabaseCluster;
use crate::error::Result;

/// Periodically re-adds every ejected member
pub struct ReconnectProcess {
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl ReconnectProcess {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RegularProcess for ReconnectProcess {
    fn name(&self) -> &str {
        "reconnect"
    }

    fn is_due(&self) -> bool {
        let last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        last_run.map_or(true, |at| at.elapsed() >= self.interval)
    }

    async fn run(&self, cluster: &DatabaseCluster) -> Result<()> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let ejected = cluster.ejected_backends().await;
        if ejected.is_empty() {
            return Ok(());
        }
        tracing::debug!("Reconnecting {} ejected members", ejected.len());

        for backend in ejected {
            let id = backend.id().clone();
            if let Err(e) = cluster.add_database(backend).await {
                tracing::warn!("Reconnection of {} failed: {}", id, e);
                if let Err(e) = cluster.eject_database(&id).await {
                    tracing::debug!("Could not re-eject {}: {}", id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_after_interval() {
        let process = ReconnectProcess::new(Duration::from_secs(60));
        assert!(process.is_due());

        *process.last_run.lock().unwrap() = Some(Instant::now());
        assert!(!process.is_due());

        let zero = ReconnectProcess::new(Duration::ZERO);
        *zero.last_run.lock().unwrap() = Some(Instant::now());
        assert!(zero.is_due());
    }
}
