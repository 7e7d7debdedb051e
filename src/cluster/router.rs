//! Execution Router
//!
//! Replicates writes to every ready member and routes reads to one of
//! them, applying the failure policy on the way.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};

use super::registry::{FirstRun, Member, MemberRegistry};
use crate::action::{Mutation, Query, Row, WriteAction};
use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::schema;

pub(crate) struct ExecutionRouter<'a> {
    registry: &'a MemberRegistry,
    permits: &'a Arc<Semaphore>,
    protected_tables: &'a HashSet<String>,
}

impl<'a> ExecutionRouter<'a> {
    pub(crate) fn new(
        registry: &'a MemberRegistry,
        permits: &'a Arc<Semaphore>,
        protected_tables: &'a HashSet<String>,
    ) -> Self {
        Self {
            registry,
            permits,
            protected_tables,
        }
    }

    /// Run a read on one ready member, failing over until it succeeds or
    /// the failure policy gives up
    pub(crate) async fn execute_query(&self, query: &Query) -> Result<Vec<Row>> {
        loop {
            let member = self.registry.pick_random_ready().await?;
            let result = {
                let Some(_guard) = member.lock_ready().await else {
                    continue;
                };
                member.backend().execute_query(query).await
            };

            match result {
                Ok(rows) => {
                    tracing::trace!("{} served {}", member.id(), query);
                    return Ok(rows);
                }
                Err(e) => self.on_failure(&member, e).await?,
            }
        }
    }

    /// Apply a write on every ready member and queue it for the others.
    ///
    /// Returns the mutations actually applied, with generated values filled in.
    pub(crate) async fn execute_write(&self, action: &WriteAction) -> Result<Vec<Mutation>> {
        self.check_protected(action)?;
        if self.permits.is_closed() {
            return Err(Error::ShuttingDown);
        }
        if self.registry.ready_count().await == 0 {
            return Err(Error::NoAvailableBackend);
        }

        let first_run = action
            .requires_individual_run_first()
            .then(|| watch::channel(FirstRun::Pending));
        let queued_on = self
            .registry
            .enqueue_write(action, first_run.as_ref().map(|(_, rx)| rx.clone()))
            .await;
        tracing::debug!(
            "Write {} queued on {} members ({} mutations)",
            action.id(),
            queued_on,
            action.mutations().len()
        );

        let mut applied = None;
        let mut first_member = None;
        let replay = match first_run {
            Some((tx, _)) => match self.run_first(action).await {
                Ok((member, mutations)) => {
                    let resolved = action.resolved(mutations.clone());
                    tx.send_replace(FirstRun::Applied(resolved.clone()));
                    applied = Some(mutations);
                    first_member = Some(member);
                    resolved
                }
                Err(e) => {
                    tx.send_replace(FirstRun::Abandoned);
                    self.registry.discard(action.id()).await;
                    return Err(e);
                }
            },
            None => action.clone(),
        };

        let replicated = self.replicate(&replay, first_member.as_ref()).await;
        match replicated {
            Ok(Some(mutations)) => Ok(applied.unwrap_or(mutations)),
            Ok(None) => Ok(applied.unwrap_or_else(|| replay.mutations().to_vec())),
            Err(e) => {
                if applied.is_none() {
                    self.registry.discard(action.id()).await;
                }
                Err(e)
            }
        }
    }

    fn check_protected(&self, action: &WriteAction) -> Result<()> {
        let raw_drops = action.mutations().iter().filter_map(|m| match m {
            Mutation::RawSql { sql, .. } => schema::dropped_table(sql),
            _ => None,
        });
        let dropped: Vec<String> = action
            .dropped_tables()
            .map(str::to_string)
            .chain(raw_drops)
            .collect();

        match dropped
            .into_iter()
            .find(|t| self.protected_tables.contains(&t.to_lowercase()))
        {
            Some(table) => Err(Error::ProtectedTableDrop(table)),
            None => Ok(()),
        }
    }

    /// Execute a write on a single ready member, retrying elsewhere on faults
    async fn run_first(&self, action: &WriteAction) -> Result<(BackendId, Vec<Mutation>)> {
        loop {
            let member = self.registry.pick_random_ready().await?;
            let result = {
                let Some(_guard) = member.lock_ready().await else {
                    continue;
                };
                let result = member.backend().execute_write(action).await;
                if result.is_ok() {
                    member.dequeue(action.id());
                }
                result
            };

            match result {
                Ok(mutations) => {
                    tracing::debug!("Write {} ran first on {}", action.id(), member.id());
                    return Ok((member.id().clone(), mutations));
                }
                Err(e) => {
                    if let Err(e) = self.on_failure(&member, e).await {
                        member.dequeue(action.id());
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Apply `action` to every ready member still holding it in its queue.
    ///
    /// Returns the mutations applied by one of them, if any ran.
    async fn replicate(
        &self,
        action: &WriteAction,
        skip: Option<&BackendId>,
    ) -> Result<Option<Vec<Mutation>>> {
        let targets: Vec<Arc<Member>> = self
            .registry
            .ready_members()
            .await
            .into_iter()
            .filter(|m| Some(m.id()) != skip)
            .collect();
        if targets.is_empty() && skip.is_none() {
            return Err(Error::NoAvailableBackend);
        }

        let mut handles = Vec::with_capacity(targets.len());
        for member in targets {
            let permit = Arc::clone(self.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::ShuttingDown)?;
            let action = action.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = apply_queued(&member, &action).await;
                (member, result)
            }));
        }

        let mut applied = None;
        let mut failure = None;
        for joined in join_all(handles).await {
            let (member, result) = joined.map_err(|e| Error::Internal(e.to_string()))?;
            match result {
                Ok(Some(mutations)) => {
                    applied.get_or_insert(mutations);
                }
                Ok(None) => {}
                Err(e) => {
                    if let Err(e) = self.on_failure(&member, e).await {
                        member.dequeue(action.id());
                        failure.get_or_insert(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Eject a member that failed, or hand the error back when the
    /// cluster cannot afford to lose it
    async fn on_failure(&self, member: &Member, error: Error) -> Result<()> {
        if !error.should_eject() {
            tracing::debug!("{} raised to caller: {}", member.id(), error);
            return Err(error);
        }
        if self.registry.ready_count().await <= 1 {
            tracing::warn!("{} failed and is the last ready member: {}", member.id(), error);
            return Err(error);
        }

        match self.registry.eject(member.id()).await {
            Ok(_) => {
                tracing::warn!("{} failed, retrying without it: {}", member.id(), error);
                Ok(())
            }
            Err(Error::CannotRemoveLastMember) => Err(error),
            // Removed meanwhile: nothing left to route to
            Err(Error::MemberNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Apply a queued write to one member, unless it is no longer ready or
/// has already applied it during a synchronization
async fn apply_queued(member: &Member, action: &WriteAction) -> Result<Option<Vec<Mutation>>> {
    let Some(_guard) = member.lock_ready().await else {
        return Ok(None);
    };
    if !member.is_queued(action.id()) {
        return Ok(None);
    }

    match member.backend().execute_write(action).await {
        Ok(mutations) => {
            member.dequeue(action.id());
            Ok(Some(mutations))
        }
        Err(e) => {
            if e.is_application_error() {
                member.dequeue(action.id());
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Value;
    use crate::backend::{Backend, BackendRef, MemoryBackend};
    use crate::cluster::registry::MemberStatus;
    use crate::schema::{ColumnSchema, TableSchema};

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", "BIGINT").not_null().auto_increment(),
                ColumnSchema::new("name", "VARCHAR(64)"),
            ],
            &["id"],
        )
    }

    struct Fixture {
        registry: MemberRegistry,
        permits: Arc<Semaphore>,
        protected: HashSet<String>,
        backends: Vec<Arc<MemoryBackend>>,
    }

    impl Fixture {
        async fn new(ids: &[&str]) -> Self {
            let registry = MemberRegistry::new();
            let mut backends = Vec::new();
            for id in ids {
                let backend = Arc::new(MemoryBackend::new(*id).with_table(users(), vec![]).unwrap());
                registry.add(backend.clone() as BackendRef).await;
                let id = BackendId::from(*id);
                registry.mark_processing(&id).await.unwrap();
                registry.mark_ready(&id).await.unwrap();
                backends.push(backend);
            }
            Self {
                registry,
                permits: Arc::new(Semaphore::new(4)),
                protected: ["users".to_string()].into_iter().collect(),
                backends,
            }
        }

        fn router(&self) -> ExecutionRouter<'_> {
            ExecutionRouter::new(&self.registry, &self.permits, &self.protected)
        }
    }

    fn insert(name: &str) -> WriteAction {
        WriteAction::single(Mutation::Insert {
            table: "users".into(),
            columns: vec!["id".into(), "name".into()],
            values: vec![Value::Null, Value::from(name)],
            generated_key: Some("id".into()),
        })
    }

    #[tokio::test]
    async fn test_write_replays_generated_key() {
        let fixture = Fixture::new(&["a", "b", "c"]).await;
        // Diverge the key sequences so only a replay keeps them equal
        fixture.backends[2]
            .execute_write(&insert("warmup"))
            .await
            .unwrap();
        fixture.backends[2]
            .execute_write(&WriteAction::single(Mutation::Delete {
                table: "users".into(),
                primary_key: crate::action::PrimaryKey::Int(1),
                key_columns: vec![],
                expected_rows: Some(1),
            }))
            .await
            .unwrap();

        let applied = fixture.router().execute_write(&insert("ada")).await.unwrap();
        let key = match &applied[0] {
            Mutation::Insert { columns, values, .. } => {
                let idx = columns.iter().position(|c| c == "id").unwrap();
                values[idx].clone()
            }
            other => panic!("unexpected mutation {other:?}"),
        };

        for backend in &fixture.backends {
            let rows = backend.rows("users");
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][0], key);
        }
        for member in fixture.registry.all_members().await {
            assert_eq!(member.queue_len(), 0);
        }
    }

    #[tokio::test]
    async fn test_write_ejects_failing_member() {
        let fixture = Fixture::new(&["a", "b"]).await;
        fixture.backends[1].fail_always("connection reset");

        let action = WriteAction::single(Mutation::Upsert {
            table: "users".into(),
            columns: vec!["id".into(), "name".into()],
            values: vec![Value::Int(7), Value::from("grace")],
            update_columns: vec!["name".into()],
        });
        fixture.router().execute_write(&action).await.unwrap();

        let b = fixture.registry.member(&"b".into()).await.unwrap();
        assert_eq!(b.status(), MemberStatus::Ejected);
        assert!(b.is_queued(action.id()));
        assert_eq!(fixture.registry.ready_count().await, 1);
        assert_eq!(fixture.backends[0].rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_last_member_error_is_raised() {
        let fixture = Fixture::new(&["a"]).await;
        fixture.backends[0].fail_next(Error::QueryExecution("connection reset".into()));

        let err = fixture.router().execute_query(&Query::scan("users")).await.unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
        assert_eq!(fixture.registry.ready_count().await, 1);
    }

    #[tokio::test]
    async fn test_application_error_never_ejects() {
        let fixture = Fixture::new(&["a", "b"]).await;
        let action = WriteAction::single(Mutation::Delete {
            table: "users".into(),
            primary_key: crate::action::PrimaryKey::Int(42),
            key_columns: vec![],
            expected_rows: Some(1),
        });

        let err = fixture.router().execute_write(&action).await.unwrap_err();
        assert!(matches!(err, Error::WrongRowCount { .. }));
        assert_eq!(fixture.registry.ready_count().await, 2);
        for member in fixture.registry.all_members().await {
            assert!(!member.is_queued(action.id()));
        }
    }

    #[tokio::test]
    async fn test_protected_drop_is_refused() {
        let fixture = Fixture::new(&["a", "b"]).await;
        let drop = WriteAction::single(Mutation::DropTable {
            table: "users".into(),
        });
        assert!(matches!(
            fixture.router().execute_write(&drop).await,
            Err(Error::ProtectedTableDrop(_))
        ));

        let raw = WriteAction::single(Mutation::RawSql {
            sql: "DROP TABLE IF EXISTS `Users`".into(),
            affects_table: None,
        });
        assert!(matches!(
            fixture.router().execute_write(&raw).await,
            Err(Error::ProtectedTableDrop(_))
        ));
        assert!(fixture.backends[0].has_table("users"));
    }

    #[tokio::test]
    async fn test_read_fails_over() {
        let fixture = Fixture::new(&["a", "b"]).await;
        fixture.backends[0].fail_always("gone");
        fixture.backends[1].fail_always("gone");

        // Whichever is picked first gets ejected; the survivor's error is raised
        let err = fixture.router().execute_query(&Query::count("users")).await.unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
        assert_eq!(fixture.registry.ready_count().await, 1);
        assert_eq!(fixture.registry.ejected_members().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cluster_has_no_backend() {
        let fixture = Fixture::new(&[]).await;
        assert!(matches!(
            fixture.router().execute_query(&Query::scan("users")).await,
            Err(Error::NoAvailableBackend)
        ));
        assert!(matches!(
            fixture.router().execute_write(&insert("x")).await,
            Err(Error::NoAvailableBackend)
        ));
    }
}
