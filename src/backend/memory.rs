//! In-Memory Backend
//!
//! A complete backend kept in process memory. Used by the test suite and
//! by demos; supports scripted faults so eject/reconnect paths can be
//! exercised without a real database.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Backend, BackendId};
use crate::action::{Mutation, PrimaryKey, Query, Row, Value, WriteAction};
use crate::error::{Error, Result};
use crate::schema::TableSchema;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Row>,
    next_id: i64,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            next_id: 1,
        }
    }

    fn push(&mut self, row: Row) -> Result<()> {
        if row.len() != self.schema.columns.len() {
            return Err(Error::QueryExecution(format!(
                "row has {} values, table `{}` has {} columns",
                row.len(),
                self.schema.name,
                self.schema.columns.len()
            )));
        }
        if self.find_by_row_key(&row).is_some() {
            return Err(Error::QueryExecution(format!(
                "Duplicate entry for key in `{}`",
                self.schema.name
            )));
        }
        if let Some(col) = self.schema.auto_increment_column() {
            if let Some(idx) = self.schema.column_index(&col.name) {
                if let Some(id) = row[idx].as_i64() {
                    self.next_id = self.next_id.max(id + 1);
                }
            }
        }
        self.rows.push(row);
        Ok(())
    }

    fn key_indices(&self, key_columns: &[String]) -> Result<Vec<usize>> {
        let columns: Vec<String> = if key_columns.is_empty() {
            self.schema.primary_key.clone()
        } else {
            key_columns.to_vec()
        };
        columns
            .iter()
            .map(|c| {
                self.schema.column_index(c).ok_or_else(|| {
                    Error::QueryExecution(format!(
                        "Unknown column `{}` in `{}`",
                        c, self.schema.name
                    ))
                })
            })
            .collect()
    }

    fn matching(&self, key_columns: &[String], key: &PrimaryKey) -> Result<Vec<usize>> {
        let indices = self.key_indices(key_columns)?;
        let wanted = key.values();
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                indices.len() == wanted.len()
                    && indices.iter().zip(wanted.iter()).all(|(i, v)| &row[*i] == v)
            })
            .map(|(pos, _)| pos)
            .collect())
    }

    fn find_by_row_key(&self, row: &Row) -> Option<usize> {
        if self.schema.primary_key.is_empty() {
            return None;
        }
        let indices = self.key_indices(&[]).ok()?;
        self.rows
            .iter()
            .position(|existing| indices.iter().all(|i| existing[*i] == row[*i]))
    }

    /// Build a full row from named columns, generating the key if asked
    fn build_row(
        &mut self,
        columns: &[String],
        values: &[Value],
        generated_key: Option<&str>,
    ) -> Result<(Row, Option<Value>)> {
        let mut generated = None;
        let mut row = Vec::with_capacity(self.schema.columns.len());
        for col in &self.schema.columns {
            let provided = columns
                .iter()
                .position(|c| c == &col.name)
                .and_then(|i| values.get(i).cloned());
            let value = match provided {
                Some(v) if generated_key != Some(col.name.as_str()) => v,
                _ if generated_key == Some(col.name.as_str()) || col.auto_increment => {
                    let id = Value::Int(self.next_id);
                    self.next_id += 1;
                    if generated_key == Some(col.name.as_str()) {
                        generated = Some(id.clone());
                    }
                    id
                }
                _ => Value::Null,
            };
            row.push(value);
        }
        Ok((row, generated))
    }
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    faults: VecDeque<Error>,
    failing: Option<String>,
    in_transaction: bool,
    closed: bool,
}

/// In-memory backend
pub struct MemoryBackend {
    id: BackendId,
    state: Mutex<MemoryState>,
    hold: watch::Sender<bool>,
    queries: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new(id: impl Into<BackendId>) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            id: id.into(),
            state: Mutex::new(MemoryState::default()),
            hold,
            queries: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Seed a table with rows
    pub fn with_table(self, schema: TableSchema, rows: Vec<Row>) -> Result<Self> {
        {
            let mut state = self.lock();
            let mut table = MemoryTable::new(schema.clone());
            for row in rows {
                table.push(row)?;
            }
            state.tables.insert(schema.name.clone(), table);
        }
        Ok(self)
    }

    /// Fail the next operation with the given error
    pub fn fail_next(&self, error: Error) {
        self.lock().faults.push_back(error);
    }

    /// Fail every operation until healed, as if the connection were gone
    pub fn fail_always(&self, reason: &str) {
        self.lock().failing = Some(reason.to_string());
    }

    /// Clear every scripted fault
    pub fn heal(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.failing = None;
    }

    /// Simulate an open transaction: writes fail until it ends
    pub fn set_in_transaction(&self, open: bool) {
        self.lock().in_transaction = open;
    }

    /// Block every operation until `release` is called
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    /// Let held operations proceed
    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Rows currently stored in a table
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Whether a table is present, without going through the fault path
    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    /// Number of queries served
    pub fn queries_served(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of write actions applied
    pub fn writes_applied(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait out a hold, then apply scripted faults
    async fn enter(&self) -> Result<()> {
        let mut rx = self.hold.subscribe();
        let _ = rx.wait_for(|held| !*held).await;

        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionFailed {
                address: self.id.to_string(),
                reason: "backend closed".into(),
            });
        }
        if let Some(reason) = &state.failing {
            return Err(Error::QueryExecution(reason.clone()));
        }
        match state.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn table<'a>(tables: &'a mut HashMap<String, MemoryTable>, name: &str) -> Result<&'a mut MemoryTable> {
        tables
            .get_mut(name)
            .ok_or_else(|| Error::QueryExecution(format!("Table `{}` doesn't exist", name)))
    }

    fn apply(tables: &mut HashMap<String, MemoryTable>, mutation: &Mutation) -> Result<Mutation> {
        match mutation {
            Mutation::Insert {
                table,
                columns,
                values,
                generated_key,
            } => {
                let t = Self::table(tables, table)?;
                let (row, generated) = t.build_row(columns, values, generated_key.as_deref())?;
                t.push(row)?;
                Ok(match generated {
                    Some(key) => mutation.with_generated_key(key),
                    None => mutation.clone(),
                })
            }

            Mutation::Update {
                table,
                set_columns,
                set_values,
                primary_key,
                key_columns,
                expected_rows,
            } => {
                let t = Self::table(tables, table)?;
                let positions = t.matching(key_columns, primary_key)?;
                check_rows(*expected_rows, positions.len() as u64)?;
                let set_indices: Vec<usize> = set_columns
                    .iter()
                    .map(|c| {
                        t.schema.column_index(c).ok_or_else(|| {
                            Error::QueryExecution(format!("Unknown column `{}`", c))
                        })
                    })
                    .collect::<Result<_>>()?;
                for pos in positions {
                    for (idx, value) in set_indices.iter().zip(set_values.iter()) {
                        t.rows[pos][*idx] = value.clone();
                    }
                }
                Ok(mutation.clone())
            }

            Mutation::Delete {
                table,
                primary_key,
                key_columns,
                expected_rows,
            } => {
                let t = Self::table(tables, table)?;
                let positions = t.matching(key_columns, primary_key)?;
                check_rows(*expected_rows, positions.len() as u64)?;
                for pos in positions.into_iter().rev() {
                    t.rows.remove(pos);
                }
                Ok(mutation.clone())
            }

            Mutation::Upsert {
                table,
                columns,
                values,
                update_columns,
            } => {
                let t = Self::table(tables, table)?;
                let (row, _) = t.build_row(columns, values, None)?;
                match t.find_by_row_key(&row) {
                    Some(pos) => {
                        for col in update_columns {
                            if let Some(idx) = t.schema.column_index(col) {
                                t.rows[pos][idx] = row[idx].clone();
                            }
                        }
                    }
                    None => t.push(row)?,
                }
                Ok(mutation.clone())
            }

            Mutation::DropTable { table } => {
                tables.remove(table);
                Ok(mutation.clone())
            }

            Mutation::CreateTable { table, .. } | Mutation::AlterTable { table, .. } => Err(
                Error::UnsupportedQuery(format!("DDL on `{}` needs a SQL backend", table)),
            ),

            Mutation::RawSql { .. } => Err(Error::UnsupportedQuery(
                "raw SQL needs a SQL backend".into(),
            )),
        }
    }
}

fn check_rows(expected: Option<u64>, actual: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::WrongRowCount { expected, actual }),
        _ => Ok(()),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>> {
        self.enter().await?;
        self.queries.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        match query {
            Query::Scan { table } => Ok(Self::table(&mut state.tables, table)?.rows.clone()),
            Query::Count { table } => {
                let count = Self::table(&mut state.tables, table)?.rows.len();
                Ok(vec![vec![Value::Int(count as i64)]])
            }
            Query::Lookup {
                table,
                key_columns,
                key,
            } => {
                let t = Self::table(&mut state.tables, table)?;
                let positions = t.matching(key_columns, key)?;
                Ok(positions.into_iter().map(|p| t.rows[p].clone()).collect())
            }
            Query::Sql(_) => Err(Error::UnsupportedQuery(format!(
                "{} cannot run raw SQL",
                self.id
            ))),
        }
    }

    async fn execute_write(&self, action: &WriteAction) -> Result<Vec<Mutation>> {
        self.enter().await?;

        let mut state = self.lock();
        if state.in_transaction {
            return Err(Error::WriteInTransaction);
        }

        // Work on a copy so a failing mutation leaves nothing behind
        let mut tables = state.tables.clone();
        let mut applied = Vec::with_capacity(action.mutations().len());
        for mutation in action.mutations() {
            applied.push(Self::apply(&mut tables, mutation)?);
        }
        state.tables = tables;
        self.writes.fetch_add(1, Ordering::Relaxed);

        tracing::trace!("{} applied action {}", self.id, action.id());
        Ok(applied)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.enter().await?;
        Ok(self.lock().tables.contains_key(table))
    }

    async fn create_table(&self, table: &TableSchema) -> Result<()> {
        self.enter().await?;
        self.lock()
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| MemoryTable::new(table.clone()));
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.enter().await?;
        let mut state = self.lock();
        Ok(Self::table(&mut state.tables, table)?.rows.len() as u64)
    }

    async fn fetch_all_rows(&self, table: &TableSchema) -> Result<Vec<Row>> {
        self.enter().await?;
        let mut state = self.lock();
        let t = Self::table(&mut state.tables, &table.name)?;

        // Project onto the requested column order
        let indices: Vec<Option<usize>> = table
            .columns
            .iter()
            .map(|c| t.schema.column_index(&c.name))
            .collect();
        Ok(t.rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|i| i.map(|i| row[i].clone()).unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    async fn bulk_insert(&self, table: &TableSchema, rows: &[Row]) -> Result<()> {
        self.enter().await?;
        let mut state = self.lock();
        let mut t = Self::table(&mut state.tables, &table.name)?.clone();
        for row in rows {
            t.push(row.clone())?;
        }
        state.tables.insert(table.name.clone(), t);
        Ok(())
    }

    async fn delete_all_rows(&self, table: &str) -> Result<()> {
        self.enter().await?;
        let mut state = self.lock();
        Self::table(&mut state.tables, table)?.rows.clear();
        Ok(())
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}
