//! Mutations and SQL Values
//!
//! Defines the concrete row-level and schema-level changes carried by a
//! write action, and how they render to MariaDB SQL.

use serde::{Deserialize, Serialize};

/// Primary key representation supporting multiple column types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// Single integer primary key
    Int(i64),
    /// Single string primary key
    String(String),
    /// Single UUID primary key
    Uuid(uuid::Uuid),
    /// Composite primary key (multiple columns)
    Composite(Vec<Value>),
}

impl PrimaryKey {
    /// Convert to SQL WHERE clause fragment
    pub fn to_where_clause(&self, key_columns: &[String]) -> String {
        const DEFAULT_COL: &str = "id";
        match self {
            PrimaryKey::Composite(values) => {
                let clauses: Vec<String> = key_columns
                    .iter()
                    .zip(values.iter())
                    .map(|(col, val)| format!("`{}` = {}", col, val.to_sql()))
                    .collect();
                clauses.join(" AND ")
            }
            single => {
                let col = key_columns.first().map(|s| s.as_str()).unwrap_or(DEFAULT_COL);
                let value = single.values().remove(0);
                format!("`{}` = {}", col, value.to_sql())
            }
        }
    }

    /// Key as column values, in key column order
    pub fn values(&self) -> Vec<Value> {
        match self {
            PrimaryKey::Int(v) => vec![Value::Int(*v)],
            PrimaryKey::String(v) => vec![Value::String(v.clone())],
            PrimaryKey::Uuid(v) => vec![Value::Uuid(*v)],
            PrimaryKey::Composite(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimaryKey::Int(v) => write!(f, "{}", v),
            PrimaryKey::String(v) => write!(f, "{}", v),
            PrimaryKey::Uuid(v) => write!(f, "{}", v),
            PrimaryKey::Composite(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// SQL Value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Convert to SQL literal
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", escape(s)),
            Value::Bytes(b) => format!("X'{}'", hex::encode(b)),
            Value::Uuid(u) => format!("'{}'", u),
            Value::Timestamp(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f")),
            Value::Json(j) => format!("'{}'", escape(&j.to_string())),
        }
    }

    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view, used for generated keys
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::UInt(u) => {
                3u8.hash(state);
                u.hash(state);
            }
            Value::Float(f) => {
                4u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::String(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Uuid(u) => {
                7u8.hash(state);
                u.hash(state);
            }
            Value::Timestamp(t) => {
                8u8.hash(state);
                t.timestamp_nanos_opt().hash(state);
            }
            Value::Json(j) => {
                9u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A single change applied to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert a new row.
    ///
    /// When `generated_key` names a column, the first backend to run the
    /// insert generates that column's value and reports it back.
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        #[serde(default)]
        generated_key: Option<String>,
    },

    /// Update existing row(s)
    Update {
        table: String,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        primary_key: PrimaryKey,
        key_columns: Vec<String>,
        /// Fail with a wrong-row-count error unless exactly this many rows change
        #[serde(default)]
        expected_rows: Option<u64>,
    },

    /// Delete row(s)
    Delete {
        table: String,
        primary_key: PrimaryKey,
        key_columns: Vec<String>,
        #[serde(default)]
        expected_rows: Option<u64>,
    },

    /// Upsert (INSERT ... ON DUPLICATE KEY UPDATE)
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        update_columns: Vec<String>,
    },

    /// CREATE TABLE statement
    CreateTable { table: String, ddl: String },

    /// ALTER TABLE statement
    AlterTable { table: String, ddl: String },

    /// DROP TABLE statement
    DropTable { table: String },

    /// Raw SQL (for operations that don't fit other categories)
    RawSql {
        sql: String,
        affects_table: Option<String>,
    },
}

impl Mutation {
    /// Get the table name affected by this mutation (if known)
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Mutation::Insert { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::Delete { table, .. }
            | Mutation::Upsert { table, .. }
            | Mutation::CreateTable { table, .. }
            | Mutation::AlterTable { table, .. }
            | Mutation::DropTable { table } => Some(table),
            Mutation::RawSql { affects_table, .. } => affects_table.as_deref(),
        }
    }

    /// Check if this is a DDL (schema change) operation
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Mutation::CreateTable { .. } | Mutation::AlterTable { .. } | Mutation::DropTable { .. }
        )
    }

    /// Check if executing this mutation generates a value other backends must reuse
    pub fn generates_key(&self) -> bool {
        matches!(self, Mutation::Insert { generated_key: Some(_), .. })
    }

    /// Rows this mutation must touch, if the caller pinned it
    pub fn expected_rows(&self) -> Option<u64> {
        match self {
            Mutation::Update { expected_rows, .. } | Mutation::Delete { expected_rows, .. } => {
                *expected_rows
            }
            _ => None,
        }
    }

    /// Convert to a SQL statement
    pub fn to_sql(&self) -> String {
        match self {
            Mutation::Insert {
                table,
                columns,
                values,
                ..
            } => format!(
                "INSERT INTO `{}` ({}) VALUES ({})",
                table,
                column_list(columns),
                value_list(values)
            ),

            Mutation::Update {
                table,
                set_columns,
                set_values,
                primary_key,
                key_columns,
                ..
            } => {
                let sets: Vec<String> = set_columns
                    .iter()
                    .zip(set_values.iter())
                    .map(|(col, val)| format!("`{}` = {}", col, val.to_sql()))
                    .collect();
                format!(
                    "UPDATE `{}` SET {} WHERE {}",
                    table,
                    sets.join(", "),
                    primary_key.to_where_clause(key_columns)
                )
            }

            Mutation::Delete {
                table,
                primary_key,
                key_columns,
                ..
            } => format!(
                "DELETE FROM `{}` WHERE {}",
                table,
                primary_key.to_where_clause(key_columns)
            ),

            Mutation::Upsert {
                table,
                columns,
                values,
                update_columns,
            } => {
                let updates: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("`{}` = VALUES(`{}`)", c, c))
                    .collect();
                format!(
                    "INSERT INTO `{}` ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                    table,
                    column_list(columns),
                    value_list(values),
                    updates.join(", ")
                )
            }

            Mutation::CreateTable { ddl, .. } | Mutation::AlterTable { ddl, .. } => ddl.clone(),

            Mutation::DropTable { table } => format!("DROP TABLE IF EXISTS `{}`", table),

            Mutation::RawSql { sql, .. } => sql.clone(),
        }
    }

    /// Copy of an insert with the generated key filled in
    pub fn with_generated_key(&self, key: Value) -> Mutation {
        match self {
            Mutation::Insert {
                table,
                columns,
                values,
                generated_key: Some(key_column),
            } => {
                let mut columns = columns.clone();
                let mut values = values.clone();
                match columns
                    .iter()
                    .position(|c| c == key_column)
                    .and_then(|idx| values.get_mut(idx))
                {
                    Some(slot) => *slot = key,
                    None => {
                        columns.push(key_column.clone());
                        values.push(key);
                    }
                }
                Mutation::Insert {
                    table: table.clone(),
                    columns,
                    values,
                    generated_key: None,
                }
            }
            other => other.clone(),
        }
    }
}

pub(crate) fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn value_list(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_sql())
        .collect::<Vec<_>>()
        .join(", ")
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_to_sql() {
        let m = Mutation::Insert {
            table: "users".to_string(),
            columns: vec!["id".to_string(), "name".to_string(), "email".to_string()],
            values: vec![
                Value::Int(1),
                Value::String("Alice".to_string()),
                Value::String("alice@example.com".to_string()),
            ],
            generated_key: None,
        };

        let sql = m.to_sql();
        assert!(sql.contains("INSERT INTO `users`"));
        assert!(sql.contains("'Alice'"));
    }

    #[test]
    fn test_update_to_sql() {
        let m = Mutation::Update {
            table: "users".to_string(),
            set_columns: vec!["name".to_string()],
            set_values: vec![Value::String("O'Brien".to_string())],
            primary_key: PrimaryKey::Int(1),
            key_columns: vec!["id".to_string()],
            expected_rows: Some(1),
        };

        let sql = m.to_sql();
        assert!(sql.contains("UPDATE `users`"));
        assert!(sql.contains("SET `name` = 'O''Brien'"));
        assert!(sql.contains("WHERE `id` = 1"));
        assert_eq!(m.expected_rows(), Some(1));
    }

    #[test]
    fn test_composite_where_clause() {
        let key = PrimaryKey::Composite(vec![Value::Int(7), Value::from("eu")]);
        let clause = key.to_where_clause(&["id".to_string(), "region".to_string()]);
        assert_eq!(clause, "`id` = 7 AND `region` = 'eu'");
    }

    #[test]
    fn test_with_generated_key() {
        let m = Mutation::Insert {
            table: "orders".to_string(),
            columns: vec!["item".to_string()],
            values: vec![Value::from("book")],
            generated_key: Some("id".to_string()),
        };
        assert!(m.generates_key());

        match m.with_generated_key(Value::Int(42)) {
            Mutation::Insert {
                columns,
                values,
                generated_key,
                ..
            } => {
                assert_eq!(columns, vec!["item".to_string(), "id".to_string()]);
                assert_eq!(values[1], Value::Int(42));
                assert!(generated_key.is_none());
            }
            other => panic!("unexpected mutation: {:?}", other),
        }
    }
}
