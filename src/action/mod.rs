//! Write Actions and Queries
//!
//! A write action is the replayable unit the cluster replicates to every
//! member. A query is routed to a single ready member.

mod mutation;

pub use mutation::{Mutation, PrimaryKey, Value};
pub(crate) use mutation::{column_list, value_list};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row, with values in table schema column order
pub type Row = Vec<Value>;

/// Unique identifier of a write action
pub type ActionId = Uuid;

/// A replayable mutation of the cluster's data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAction {
    /// Identity shared by every replay of the same logical write
    id: ActionId,
    /// Mutations, applied in order inside one backend transaction
    mutations: Vec<Mutation>,
    /// Run on one backend first and replay its applied result elsewhere
    run_first: bool,
}

impl WriteAction {
    /// Create an action from a list of mutations
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mutations,
            run_first: false,
        }
    }

    /// Create an action holding a single mutation
    pub fn single(mutation: Mutation) -> Self {
        Self::new(vec![mutation])
    }

    /// Force the action to run on a single backend before the others
    pub fn run_first(mut self) -> Self {
        self.run_first = true;
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Check whether executing this action may produce values (generated
    /// keys) that later replays on other backends must reuse
    pub fn requires_individual_run_first(&self) -> bool {
        self.run_first || self.mutations.iter().any(Mutation::generates_key)
    }

    /// Build the deterministic replay of this action from what the first
    /// backend actually applied
    pub fn resolved(&self, applied: Vec<Mutation>) -> WriteAction {
        WriteAction {
            id: self.id,
            mutations: applied,
            run_first: false,
        }
    }

    /// Tables dropped by this action
    pub fn dropped_tables(&self) -> impl Iterator<Item = &str> {
        self.mutations.iter().filter_map(|m| match m {
            Mutation::DropTable { table } => Some(table.as_str()),
            _ => None,
        })
    }
}

/// A read routed to one ready member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Every row of a table, in schema column order
    Scan { table: String },
    /// Row count of a table, returned as a single `Int` row
    Count { table: String },
    /// Rows of a table matching a key
    Lookup {
        table: String,
        key_columns: Vec<String>,
        key: PrimaryKey,
    },
    /// Raw SQL, for backends that speak it
    Sql(String),
}

impl Query {
    pub fn scan(table: impl Into<String>) -> Self {
        Query::Scan { table: table.into() }
    }

    pub fn count(table: impl Into<String>) -> Self {
        Query::Count { table: table.into() }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Query::Scan { table } => write!(f, "SCAN {}", table),
            Query::Count { table } => write!(f, "COUNT {}", table),
            Query::Lookup { table, key, .. } => write!(f, "LOOKUP {} {}", table, key),
            Query::Sql(sql) => write!(f, "SQL {}", sql.chars().take(50).collect::<String>()),
        }
    }
}
