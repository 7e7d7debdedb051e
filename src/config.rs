//! WolfCluster Configuration
//!
//! This module provides configuration structures for the cluster
//! coordinator: which databases to connect, which tables they must carry,
//! and how the coordinator schedules its work.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::backend::BackendId;
use crate::schema::TableSchema;

/// Main WolfCluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfClusterConfig {
    /// Coordinator configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Connection descriptors, one per cluster member
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    /// Tables every member must carry
    #[serde(default)]
    pub tables: Vec<TableSchema>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, used in logs
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Maximum number of write replication tasks running at once
    #[serde(default = "default_max_parallel_writes")]
    pub max_parallel_writes: usize,

    /// Scheduler tick in milliseconds
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// Interval between reconnection attempts for ejected members
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Tables that can never be dropped through the cluster
    /// (defaults to every required table)
    #[serde(default)]
    pub protected_tables: Option<Vec<String>>,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    pub database: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, compact, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_cluster_name() -> String {
    "wolfcluster".to_string()
}

fn default_max_parallel_writes() -> usize {
    16
}

fn default_scheduler_tick_ms() -> u64 {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            max_parallel_writes: default_max_parallel_writes(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            protected_tables: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Get scheduler tick as Duration
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    /// Get reconnection interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl DatabaseConfig {
    /// Normalized identity of the connection target
    pub fn identity(&self) -> BackendId {
        BackendId::new(format!(
            "{}@{}:{}/{}",
            self.user,
            self.host.to_lowercase(),
            self.port,
            self.database
        ))
    }

    /// Get database connection URL
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl WolfClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.databases.is_empty() {
            return Err(crate::Error::Config("at least one database is required".into()));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.host.is_empty() {
                return Err(crate::Error::Config("database.host cannot be empty".into()));
            }
            if !seen.insert(db.identity()) {
                return Err(crate::Error::Config(format!(
                    "database {} is listed twice",
                    db.identity()
                )));
            }
        }

        for table in &self.tables {
            table.validate()?;
        }

        if self.cluster.max_parallel_writes == 0 {
            return Err(crate::Error::Config(
                "cluster.max_parallel_writes must be at least 1".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "full" | "compact" | "pretty") {
            return Err(crate::Error::Config(format!(
                "unknown logging.format `{}`",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Tables that can never be dropped through the cluster
    pub fn protected_tables(&self) -> Vec<String> {
        match &self.cluster.protected_tables {
            Some(tables) => tables.clone(),
            None => self.tables.iter().map(|t| t.name.clone()).collect(),
        }
    }

    /// Example configuration written by `wolfcluster init`
    pub fn example() -> String {
        r#"[cluster]
name = "wolfcluster"
max_parallel_writes = 16
scheduler_tick_ms = 1000
reconnect_interval_ms = 5000

[[databases]]
host = "db1.local"
port = 3306
user = "app"
password = "secret"
database = "app"

[[databases]]
host = "db2.local"
port = 3306
user = "app"
password = "secret"
database = "app"

[[tables]]
name = "users"
primary_key = ["id"]

[[tables.columns]]
name = "id"
data_type = "BIGINT"
auto_increment = true

[[tables.columns]]
name = "name"
data_type = "VARCHAR(128)"
nullable = false

[logging]
level = "info"
format = "full"
"#
        .to_string()
    }
}
