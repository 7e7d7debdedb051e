//! Member Synchronization
//!
//! Brings a new or recovering member from an unknown data state to one
//! that matches the cluster, copying from a ready member (the template).
//! Consistency is judged by row counts per table; equal counts are taken
//! as equal contents.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::registry::{Member, MemberRegistry, MemberStatus};
use crate::backend::{Backend, BackendId};
use crate::error::{Error, Result};
use crate::schema::TableSchema;

/// What a synchronization did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Member synchronized
    pub backend: Option<BackendId>,
    /// Member the data was copied from; `None` for the first member
    pub template: Option<BackendId>,
    /// Nothing ran: the member was ready, already synchronizing, or administratively held
    pub skipped: bool,
    pub tables_created: usize,
    pub tables_copied: usize,
    pub rows_copied: u64,
    pub writes_replayed: usize,
}

impl SyncReport {
    fn skipped(id: &BackendId) -> Self {
        Self {
            backend: Some(id.clone()),
            skipped: true,
            ..Default::default()
        }
    }
}

pub(crate) struct Synchronizer<'a> {
    registry: &'a MemberRegistry,
    tables: &'a [TableSchema],
}

impl<'a> Synchronizer<'a> {
    pub(crate) fn new(registry: &'a MemberRegistry, tables: &'a [TableSchema]) -> Self {
        Self { registry, tables }
    }

    /// Synchronize a member and mark it ready.
    ///
    /// On failure the member leaves PROCESSING for `on_failure`, unless it
    /// was ejected before, in which case it stays ejected.
    pub(crate) async fn synchronize(
        &self,
        id: &BackendId,
        on_failure: MemberStatus,
    ) -> Result<SyncReport> {
        let member = self.registry.member(id).await?;
        let Some(previous) = self.registry.mark_processing(id).await? else {
            tracing::debug!("Member {} is {}, not synchronizing", id, member.status());
            return Ok(SyncReport::skipped(id));
        };

        tracing::info!("Synchronizing {} (was {})", id, previous);
        match self.run(&member).await {
            Ok(report) => {
                tracing::info!(
                    "Member {} ready: {} tables created, {} copied ({} rows), {} writes replayed",
                    id,
                    report.tables_created,
                    report.tables_copied,
                    report.rows_copied,
                    report.writes_replayed
                );
                Ok(report)
            }
            Err(e) => {
                let status = if previous == MemberStatus::Ejected {
                    MemberStatus::Ejected
                } else {
                    on_failure
                };
                self.registry.mark_failed(id, status).await?;
                tracing::warn!("Synchronization of {} failed, now {}: {}", id, status, e);
                Err(e.into_sync_error(id))
            }
        }
    }

    async fn run(&self, member: &Arc<Member>) -> Result<SyncReport> {
        let mut report = SyncReport {
            backend: Some(member.id().clone()),
            ..Default::default()
        };

        // Held until the member is ready: no other traffic reaches it meanwhile
        let _guard = member.lock().await;

        match self.registry.template_member(member.id()).await {
            Ok(template) => {
                let _template_guard = template.lock().await;
                if template.status() != MemberStatus::Ready {
                    return Err(Error::Synchronization {
                        backend: member.id().to_string(),
                        reason: format!("template {} left the ready set", template.id()),
                    });
                }
                report.template = Some(template.id().clone());

                let mut copied = HashSet::new();
                for table in self.tables {
                    if self
                        .copy_table(template.backend().as_ref(), member.backend().as_ref(), table, &mut report)
                        .await?
                    {
                        copied.insert(table.name.to_lowercase());
                    }
                }

                let dropped = self.registry.adopt_pending(member, &template, &copied).await;
                tracing::trace!(
                    "{} has {} writes to replay after copying from {} ({} carried by copied rows)",
                    member.id(),
                    member.queue_len(),
                    template.id(),
                    dropped
                );
            }
            Err(Error::NoAvailableBackend) => {
                tracing::info!("No ready member to copy from, {} seeds the cluster", member.id());
                for table in self.tables {
                    if !member.backend().table_exists(&table.name).await? {
                        member.backend().create_table(table).await?;
                        report.tables_created += 1;
                    }
                }
            }
            Err(e) => return Err(e),
        }

        self.drain(member, &mut report).await?;
        Ok(report)
    }

    /// Make one table on `target` match `template` by row count.
    ///
    /// Returns whether the target's rows were replaced by the template's.
    async fn copy_table(
        &self,
        template: &dyn Backend,
        target: &dyn Backend,
        table: &TableSchema,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let name = table.name.as_str();
        if !template.table_exists(name).await? {
            tracing::debug!("Table `{}` absent on template {}, skipping", name, template.id());
            return Ok(false);
        }

        if !target.table_exists(name).await? {
            target.create_table(table).await?;
            report.tables_created += 1;
        }

        let source_count = template.row_count(name).await?;
        let target_count = target.row_count(name).await?;
        if source_count == target_count {
            tracing::debug!("Table `{}` has {} rows on both sides", name, source_count);
            return Ok(false);
        }

        tracing::debug!(
            "Table `{}`: {} rows on {}, {} on {}, copying",
            name,
            source_count,
            template.id(),
            target_count,
            target.id()
        );

        if target_count > 0 {
            target.delete_all_rows(name).await?;
        }
        if source_count > 0 {
            let rows = template.fetch_all_rows(table).await?;
            target.bulk_insert(table, &rows).await?;
            report.rows_copied += rows.len() as u64;
        }
        report.tables_copied += 1;
        Ok(true)
    }

    /// Apply queued writes oldest first, then mark the member ready
    async fn drain(&self, member: &Arc<Member>, report: &mut SyncReport) -> Result<()> {
        loop {
            match member.front() {
                Some(queued) => {
                    if let Some(action) = queued.replay().await {
                        match member.backend().execute_write(&action).await {
                            Ok(_) => report.writes_replayed += 1,
                            // Rejected the same way wherever it ran
                            Err(e) if e.is_application_error() => {
                                tracing::warn!("{} skipped write {}: {}", member.id(), action.id(), e);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    member.dequeue(queued.id());
                }
                None => {
                    if self.registry.mark_ready(member.id()).await? {
                        return Ok(());
                    }
                }
            }
        }
    }
}
