//! Database Backends
//!
//! A backend is one connected database the cluster drives. The cluster
//! never talks SQL itself; it goes through this trait.

mod mariadb;
pub mod memory;

pub use mariadb::MariaDbBackend;
pub use memory::MemoryBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{Mutation, Query, Row, WriteAction};
use crate::error::Result;
use crate::schema::TableSchema;

/// Stable identity of a connection target.
///
/// Two backends with the same identity are the same cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single connected database.
///
/// Implementations need not support concurrent use: the cluster runs at
/// most one operation at a time against a given backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identity used for deduplication
    fn id(&self) -> &BackendId;

    /// Run a read
    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>>;

    /// Apply a write action, returning the concrete mutations applied.
    ///
    /// Generated values (autoincrement keys) are filled into the returned
    /// mutations so other backends can replay them verbatim.
    async fn execute_write(&self, action: &WriteAction) -> Result<Vec<Mutation>>;

    /// Check if a table exists
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Create a table
    async fn create_table(&self, table: &TableSchema) -> Result<()>;

    /// Count the rows of a table
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Fetch every row of a table, in schema column order
    async fn fetch_all_rows(&self, table: &TableSchema) -> Result<Vec<Row>>;

    /// Insert rows in schema column order
    async fn bulk_insert(&self, table: &TableSchema, rows: &[Row]) -> Result<()>;

    /// Delete every row of a table
    async fn delete_all_rows(&self, table: &str) -> Result<()>;

    /// Release connections
    async fn close(&self);
}

/// Shared handle to a backend
pub type BackendRef = Arc<dyn Backend>;
