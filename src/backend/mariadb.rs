//! MariaDB Backend
//!
//! Drives one MariaDB (or MySQL) database through its own connection pool.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row as _, TypeInfo, ValueRef};

use super::{Backend, BackendId};
use crate::action::{column_list, value_list, Mutation, Query, Row, Value, WriteAction};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::schema::TableSchema;

/// Rows per INSERT statement when copying a table
const BULK_CHUNK_ROWS: usize = 500;

/// MariaDB backend with an owned connection pool
pub struct MariaDbBackend {
    id: BackendId,
    pool: MySqlPool,
    address: String,
}

impl MariaDbBackend {
    /// Connect a new pool for the given database
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url())
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!("Connected to {} ({})", config.identity(), address);

        Ok(Self {
            id: config.identity(),
            pool,
            address,
        })
    }

    /// Check if connection is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query_as("SELECT 1").fetch_one(&self.pool),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout(self.address.clone()))??;

        Ok(result.0 == 1)
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<Row>> {
        tracing::debug!("{} query: {}", self.id, truncate(sql));
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::QueryExecution(format!("Failed to run '{}': {}", truncate(sql), e)))?;

        rows.iter().map(decode_row).collect()
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM `{}`", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[async_trait]
impl Backend for MariaDbBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>> {
        match query {
            Query::Scan { table } => self.fetch(&format!("SELECT * FROM `{}`", table)).await,
            Query::Count { table } => {
                let count = self.count(table).await?;
                Ok(vec![vec![Value::Int(count as i64)]])
            }
            Query::Lookup {
                table,
                key_columns,
                key,
            } => {
                self.fetch(&format!(
                    "SELECT * FROM `{}` WHERE {}",
                    table,
                    key.to_where_clause(key_columns)
                ))
                .await
            }
            Query::Sql(sql) => self.fetch(sql).await,
        }
    }

    async fn execute_write(&self, action: &WriteAction) -> Result<Vec<Mutation>> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(action.mutations().len());

        for mutation in action.mutations() {
            let sql = match mutation {
                Mutation::Insert {
                    table,
                    columns,
                    values,
                    generated_key: Some(key),
                } => {
                    // Let the database pick the key
                    let (columns, values): (Vec<String>, Vec<Value>) = columns
                        .iter()
                        .cloned()
                        .zip(values.iter().cloned())
                        .filter(|(c, _)| c != key)
                        .unzip();
                    format!(
                        "INSERT INTO `{}` ({}) VALUES ({})",
                        table,
                        column_list(&columns),
                        value_list(&values)
                    )
                }
                other => other.to_sql(),
            };

            tracing::debug!("{} executing: {}", self.id, truncate(&sql));
            let result = sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::QueryExecution(format!("Failed to execute '{}': {}", truncate(&sql), e))
                })?;

            if let Some(expected) = mutation.expected_rows() {
                if result.rows_affected() != expected {
                    return Err(Error::WrongRowCount {
                        expected,
                        actual: result.rows_affected(),
                    });
                }
            }

            if mutation.generates_key() {
                let id = i64::try_from(result.last_insert_id()).map_err(|_| {
                    Error::Internal(format!("generated key {} overflows", result.last_insert_id()))
                })?;
                applied.push(mutation.with_generated_key(Value::Int(id)));
            } else {
                applied.push(mutation.clone());
            }
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    async fn create_table(&self, table: &TableSchema) -> Result<()> {
        let sql = table.create_sql();
        tracing::info!("{} creating table `{}`", self.id, table.name);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::QueryExecution(format!("Failed to create `{}`: {}", table.name, e)))?;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.count(table).await
    }

    async fn fetch_all_rows(&self, table: &TableSchema) -> Result<Vec<Row>> {
        let order = if table.primary_key.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", column_list(&table.primary_key))
        };
        self.fetch(&format!(
            "SELECT {} FROM `{}`{}",
            column_list(&table.column_names()),
            table.name,
            order
        ))
        .await
    }

    async fn bulk_insert(&self, table: &TableSchema, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let columns = column_list(&table.column_names());
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let values: Vec<String> = chunk
                .iter()
                .map(|row| format!("({})", value_list(row)))
                .collect();
            let sql = format!(
                "INSERT INTO `{}` ({}) VALUES {}",
                table.name,
                columns,
                values.join(", ")
            );
            sqlx::query(&sql).execute(&mut *tx).await.map_err(|e| {
                Error::QueryExecution(format!("Bulk insert into `{}` failed: {}", table.name, e))
            })?;
        }

        tx.commit().await?;
        tracing::debug!("{} copied {} rows into `{}`", self.id, rows.len(), table.name);
        Ok(())
    }

    async fn delete_all_rows(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM `{}`", table))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::QueryExecution(format!("Failed to clear `{}`: {}", table, e)))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn truncate(sql: &str) -> String {
    sql.chars().take(100).collect()
}

/// Decode a result row into values, by column type
fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get(idx)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => Value::Int(row.try_get(idx)?),
        name if name.ends_with("UNSIGNED") => Value::UInt(row.try_get(idx)?),
        "DOUBLE" => Value::Float(row.try_get(idx)?),
        "FLOAT" => Value::Float(row.try_get::<f32, _>(idx)? as f64),
        "TIMESTAMP" => Value::Timestamp(row.try_get(idx)?),
        "DATETIME" => {
            let naive: chrono::NaiveDateTime = row.try_get(idx)?;
            Value::Timestamp(naive.and_utc())
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            Value::Bytes(row.try_get(idx)?)
        }
        "JSON" => {
            let text: String = row.try_get(idx)?;
            serde_json::from_str(&text)
                .map(Value::Json)
                .unwrap_or(Value::String(text))
        }
        _ => match row.try_get::<String, _>(idx) {
            Ok(text) => Value::String(text),
            Err(_) => {
                let bytes: Vec<u8> = row.try_get(idx)?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
        },
    };

    Ok(value)
}
