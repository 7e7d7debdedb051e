//! WolfCluster - Database Cluster Coordinator
//!
//! Presents several independent SQL databases as one logical database,
//! keeping every member consistent with the others.
//!
//! # Architecture
//!
//! Each backend joins the cluster as a member with a status and a queue of
//! writes still to apply. A new or recovering member is synchronized from
//! a ready member (the template): missing tables are created, tables whose
//! row counts differ are copied, then the queue is drained and the member
//! becomes ready. Writes go to every ready member in parallel, reads to a
//! single ready member picked at random.
//!
//! # Features
//!
//! - Non-blocking member addition once the cluster has a stable template
//! - Deterministic replay of generated keys (autoincrement) across members
//! - Automatic ejection of failing members, never below one ready member
//! - Background reconnection of ejected members
//! - Pluggable periodic maintenance processes
//! - MariaDB backend over sqlx, plus an in-memory backend

pub mod action;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod schema;

pub use cluster::DatabaseCluster;
pub use config::WolfClusterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::action::{Mutation, PrimaryKey, Query, Row, Value, WriteAction};
    pub use crate::backend::{Backend, BackendId, BackendRef, MariaDbBackend, MemoryBackend};
    pub use crate::cluster::{ClusterOptions, ClusterSummary, DatabaseCluster, MemberStatus, SyncReport};
    pub use crate::config::WolfClusterConfig;
    pub use crate::error::{Error, Result};
    pub use crate::scheduler::{ProcessRef, ReconnectProcess, RegularProcess};
    pub use crate::schema::{ColumnSchema, TableSchema};
}
