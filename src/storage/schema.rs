//! Fixed table identities and their column schemas.

use std::fmt;

use super::record::SqlValue;

/// The tables this store knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    Threads,
    Messages,
    Resources,
    WorkflowSnapshot,
    Traces,
    Evals,
}

impl TableName {
    pub const ALL: [TableName; 6] = [
        TableName::Threads,
        TableName::Messages,
        TableName::Resources,
        TableName::WorkflowSnapshot,
        TableName::Traces,
        TableName::Evals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Threads => "threads",
            TableName::Messages => "messages",
            TableName::Resources => "resources",
            TableName::WorkflowSnapshot => "workflow_snapshot",
            TableName::Traces => "traces",
            TableName::Evals => "evals",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown table: {}", s))
    }
}

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Uuid,
    Timestamp,
    Integer,
    BigInt,
    Float,
    Jsonb,
    Boolean,
}

impl ColumnType {
    /// SQLite declared type. JSON and timestamps are kept as TEXT so the
    /// column has text affinity.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Uuid | ColumnType::Timestamp | ColumnType::Jsonb => {
                "TEXT"
            }
            ColumnType::Integer | ColumnType::BigInt | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Default applied when the column is added to an existing table.
    pub default: Option<SqlValue>,
}

impl ColumnDef {
    pub fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            primary_key: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Name of the unique index guarding `(workflow_name, run_id)`.
pub const WORKFLOW_SNAPSHOT_UNIQUE_KEY: &str = "workflow_snapshot_workflow_name_run_id_key";

/// Standard column schema for a table.
pub fn table_schema(table: TableName) -> Vec<ColumnDef> {
    use ColumnType::*;

    match table {
        TableName::Threads => vec![
            ColumnDef::new("id", Text).primary_key(),
            ColumnDef::new("resourceId", Text),
            ColumnDef::new("title", Text),
            ColumnDef::new("metadata", Jsonb).nullable(),
            ColumnDef::new("createdAt", Timestamp),
            ColumnDef::new("updatedAt", Timestamp),
        ],
        TableName::Messages => vec![
            ColumnDef::new("id", Text).primary_key(),
            ColumnDef::new("thread_id", Text),
            ColumnDef::new("content", Text),
            ColumnDef::new("role", Text),
            ColumnDef::new("type", Text),
            ColumnDef::new("createdAt", Timestamp),
            ColumnDef::new("resourceId", Text).nullable(),
        ],
        TableName::Resources => vec![
            ColumnDef::new("id", Text).primary_key(),
            ColumnDef::new("workingMemory", Text).nullable(),
            ColumnDef::new("metadata", Jsonb).nullable(),
            ColumnDef::new("createdAt", Timestamp),
            ColumnDef::new("updatedAt", Timestamp),
        ],
        TableName::WorkflowSnapshot => vec![
            ColumnDef::new("workflow_name", Text),
            ColumnDef::new("run_id", Text),
            ColumnDef::new("resourceId", Text).nullable(),
            ColumnDef::new("snapshot", Text),
            ColumnDef::new("createdAt", Timestamp),
            ColumnDef::new("updatedAt", Timestamp),
        ],
        TableName::Traces => vec![
            ColumnDef::new("id", Text).primary_key(),
            ColumnDef::new("parentSpanId", Text).nullable(),
            ColumnDef::new("name", Text),
            ColumnDef::new("traceId", Text),
            ColumnDef::new("scope", Text),
            ColumnDef::new("kind", Integer),
            ColumnDef::new("attributes", Jsonb).nullable(),
            ColumnDef::new("status", Jsonb).nullable(),
            ColumnDef::new("events", Jsonb).nullable(),
            ColumnDef::new("links", Jsonb).nullable(),
            ColumnDef::new("other", Text).nullable(),
            ColumnDef::new("startTime", BigInt),
            ColumnDef::new("endTime", BigInt),
            ColumnDef::new("createdAt", Timestamp),
        ],
        TableName::Evals => vec![
            ColumnDef::new("input", Text),
            ColumnDef::new("output", Text),
            ColumnDef::new("result", Jsonb),
            ColumnDef::new("agent_name", Text),
            ColumnDef::new("metric_name", Text),
            ColumnDef::new("instructions", Text),
            ColumnDef::new("test_info", Jsonb).nullable(),
            ColumnDef::new("global_run_id", Text),
            ColumnDef::new("run_id", Text),
            ColumnDef::new("created_at", Timestamp),
        ],
    }
}

/// Columns added after a table's first release, ensured on `init`.
pub fn late_columns(table: TableName) -> &'static [&'static str] {
    match table {
        TableName::Messages | TableName::WorkflowSnapshot => &["resourceId"],
        _ => &[],
    }
}
