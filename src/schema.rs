//! Table Schemas
//!
//! The required tables every member must carry, as derived from the
//! application's data model. Fixed for the lifetime of a cluster.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Table schema information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Columns, in row order
    pub columns: Vec<ColumnSchema>,
    /// Primary key columns
    #[serde(default)]
    pub primary_key: Vec<String>,
}

/// Column schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub auto_increment: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    /// Nullable column of the given SQL type
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            auto_increment: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }
}

impl TableSchema {
    /// Create a table schema
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Column names, in row order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column in a row
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Auto-increment column, if any
    pub fn auto_increment_column(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Validate the schema is usable for replication
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("table name cannot be empty".into()));
        }
        if self.columns.is_empty() {
            return Err(Error::Config(format!("table `{}` has no columns", self.name)));
        }
        for key in &self.primary_key {
            if self.column_index(key).is_none() {
                return Err(Error::Config(format!(
                    "table `{}`: primary key column `{}` is not declared",
                    self.name, key
                )));
            }
        }
        Ok(())
    }

    /// CREATE TABLE statement for MariaDB
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("`{}` {}", c.name, c.data_type);
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &c.default_value {
                    def.push_str(&format!(" DEFAULT {}", default));
                }
                if c.auto_increment {
                    def.push_str(" AUTO_INCREMENT");
                }
                def
            })
            .collect();

        if !self.primary_key.is_empty() {
            parts.push(format!(
                "PRIMARY KEY ({})",
                crate::action::column_list(&self.primary_key)
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS `{}` ({})",
            self.name,
            parts.join(", ")
        )
    }
}

/// Find the table a raw `DROP TABLE` statement drops, if it is one
pub fn dropped_table(sql: &str) -> Option<String> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("DROP TABLE") {
        return None;
    }

    let original = sql.trim_start();
    let after_table = original.get("DROP TABLE".len()..)?.trim_start();

    // Skip "IF EXISTS"
    let after_if = if after_table.to_uppercase().starts_with("IF") {
        let exists_pos = after_table.to_uppercase().find("EXISTS")?;
        after_table.get(exists_pos + "EXISTS".len()..)?.trim_start()
    } else {
        after_table
    };

    let end = after_if
        .find(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .unwrap_or(after_if.len());

    let name = after_if[..end].trim_matches('`');
    // Drop an optional schema qualifier
    let name = name.rsplit('.').next().unwrap_or(name).trim_matches('`');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
