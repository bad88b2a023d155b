use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::QueryBuilder;
use tracing::{debug, info, warn};

use super::connection::{Database, SchemaInspector};
use super::identifier::quote_identifier;
use super::pagination::DateRange;
use super::record::{format_timestamp, push_bind_value, Record, SqlValue};
use super::schema::{
    late_columns, table_schema, ColumnDef, ColumnType, TableName, WORKFLOW_SNAPSHOT_UNIQUE_KEY,
};
use super::telemetry::{ErrorTracker, TracingErrorTracker};
use super::types::StoreCapabilities;
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

mod messages;
mod observability;
mod resources;
mod threads;
mod workflows;

/// SQLite-backed store for threads, messages, resources, workflow runs,
/// traces and evals.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    tracker: Arc<dyn ErrorTracker>,
    inspector: Arc<dyn SchemaInspector>,
}

impl SqliteStore {
    /// Open a file-backed store.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        let db = Database::connect(config).await?;
        Ok(Self::from_database(db))
    }

    /// Create an in-memory store (useful for testing)
    pub async fn new_in_memory() -> StorageResult<Self> {
        let db = Database::connect_in_memory(None).await?;
        Ok(Self::from_database(db))
    }

    /// Create an in-memory store whose tables live in a named schema.
    pub async fn new_in_memory_with_schema(schema: &str) -> StorageResult<Self> {
        let db = Database::connect_in_memory(Some(schema)).await?;
        Ok(Self::from_database(db))
    }

    fn from_database(db: Database) -> Self {
        let inspector: Arc<dyn SchemaInspector> = Arc::new(db.clone());
        Self {
            db,
            tracker: Arc::new(TracingErrorTracker),
            inspector,
        }
    }

    /// Route degraded-read failures to a custom tracker.
    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Replace the live schema introspection.
    pub fn with_schema_inspector(mut self, inspector: Arc<dyn SchemaInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub fn supports(&self) -> StoreCapabilities {
        StoreCapabilities {
            select_by_include_resource_scope: true,
            resource_working_memory: true,
        }
    }

    /// Create every table with its standard schema and add late columns.
    pub async fn init(&self) -> StorageResult<()> {
        info!(schema = ?self.db.schema(), "Initializing store tables");

        for table in TableName::ALL {
            let schema = table_schema(table);
            self.create_table(table, &schema).await?;

            let late = late_columns(table);
            if !late.is_empty() {
                self.alter_table(table, &schema, late).await?;
            }
        }

        info!("Store tables ready");
        Ok(())
    }

    /// Release the connection pool.
    pub async fn close(&self) {
        self.db.close().await;
    }

    fn table(&self, table: TableName) -> StorageResult<String> {
        self.db.table_name(table.as_str())
    }

    fn track(&self, err: &StorageError) {
        self.tracker.track(err);
    }

    /// Create a table if it does not exist.
    ///
    /// `workflow_snapshot` also gets its `(workflow_name, run_id)` unique
    /// index, created if missing even when the table already existed.
    pub async fn create_table(&self, table: TableName, schema: &[ColumnDef]) -> StorageResult<()> {
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_CREATE_TABLE_FAILED",
                [("tableName", table.to_string())],
                e,
            )
        };

        let columns = schema
            .iter()
            .map(column_definition)
            .collect::<StorageResult<Vec<_>>>()?
            .join(",\n    ");
        let table_name = self.table(table)?;

        self.db.ensure_schema().await?;

        let sql = format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", table_name, columns);
        sqlx::query(&sql).execute(self.pool()).await.map_err(wrap)?;

        if table == TableName::WorkflowSnapshot {
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (workflow_name, run_id)",
                self.db.index_name(WORKFLOW_SNAPSHOT_UNIQUE_KEY)?,
                quote_identifier(table.as_str(), "table name")?,
            );
            sqlx::query(&sql).execute(self.pool()).await.map_err(wrap)?;
        }

        debug!(table = %table, "Ensured table exists");
        Ok(())
    }

    /// Add each column named in `if_not_exists` that the table lacks.
    ///
    /// Names not described by `schema` are skipped.
    pub async fn alter_table(
        &self,
        table: TableName,
        schema: &[ColumnDef],
        if_not_exists: &[&str],
    ) -> StorageResult<()> {
        let table_name = self.table(table)?;

        for column_name in if_not_exists {
            let Some(column) = schema.iter().find(|c| c.name == *column_name) else {
                continue;
            };
            let quoted = quote_identifier(column.name, "column name")?;

            if self.inspector.has_column(table.as_str(), column.name).await? {
                continue;
            }

            let mut sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table_name,
                quoted,
                column.column_type.sql_type()
            );
            if !column.nullable {
                sql.push_str(" NOT NULL DEFAULT ");
                sql.push_str(&default_literal(column));
            }

            sqlx::query(&sql).execute(self.pool()).await.map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_ALTER_TABLE_FAILED",
                    [("tableName", table.to_string())],
                    e,
                )
            })?;
            debug!(table = %table, column = column.name, "Ensured column exists");
        }

        Ok(())
    }

    /// Delete every row of a table.
    pub async fn clear_table(&self, table: TableName) -> StorageResult<()> {
        let sql = format!("DELETE FROM {}", self.table(table)?);
        sqlx::query(&sql).execute(self.pool()).await.map_err(|e| {
            StorageError::operation(
                "STORAGE_SQLITE_CLEAR_TABLE_FAILED",
                [("tableName", table.to_string())],
                e,
            )
        })?;
        Ok(())
    }

    /// Insert one record; columns are taken from the record in order.
    pub async fn insert(&self, table: TableName, record: &Record) -> StorageResult<()> {
        let mut builder = insert_query(&self.table(table)?, record)?;
        builder.build().execute(self.pool()).await.map_err(|e| {
            StorageError::operation(
                "STORAGE_SQLITE_INSERT_FAILED",
                [("tableName", table.to_string())],
                e,
            )
        })?;
        Ok(())
    }

    /// Insert every record in one transaction.
    pub async fn batch_insert(&self, table: TableName, records: &[Record]) -> StorageResult<()> {
        let table_name = self.table(table)?;
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_BATCH_INSERT_FAILED",
                [
                    ("tableName", table.to_string()),
                    ("numberOfRecords", records.len().to_string()),
                ],
                e,
            )
        };

        let mut tx = self.db.begin().await?;
        for record in records {
            let mut builder = insert_query(&table_name, record)?;
            builder.build().execute(&mut *tx).await.map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)?;

        Ok(())
    }

    /// First row whose key columns all equal the given values.
    ///
    /// Workflow snapshot rows come back with `snapshot` already parsed.
    pub async fn load(&self, table: TableName, keys: &Record) -> StorageResult<Option<Record>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {}", self.table(table)?));
        for (i, (column, value)) in keys.iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            builder.push(quote_identifier(column, "column name")?);
            builder.push(" = ");
            push_bind_value(&mut builder, value);
        }
        builder.push(" LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_LOAD_FAILED",
                    [("tableName", table.to_string())],
                    e,
                )
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut record = Record::from_row(&row)?;
        if table == TableName::WorkflowSnapshot {
            if let Some(raw) = record.text("snapshot") {
                let snapshot = parse_snapshot(&raw, record.text("workflow_name").as_deref());
                record.insert("snapshot", snapshot);
            }
        }

        Ok(Some(record))
    }
}

/// Parse a stored workflow snapshot, keeping the raw text when it is not JSON.
fn parse_snapshot(raw: &str, workflow_name: Option<&str>) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(
            workflow_name = workflow_name.unwrap_or_default(),
            error = %e,
            "Failed to parse workflow snapshot, returning raw text"
        );
        serde_json::Value::String(raw.to_string())
    })
}

/// Append inclusive bounds on a timestamp column.
fn push_date_range(builder: &mut QueryBuilder<'_, Sqlite>, column: &str, range: Option<&DateRange>) {
    let Some(range) = range else {
        return;
    };
    if let Some(start) = range.start {
        builder.push(format!(" AND {} >= ", column));
        builder.push_bind(format_timestamp(&start));
    }
    if let Some(end) = range.end {
        builder.push(format!(" AND {} <= ", column));
        builder.push_bind(format_timestamp(&end));
    }
}

/// Convert a row count reported by SQLite.
fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn column_definition(column: &ColumnDef) -> StorageResult<String> {
    let mut definition = format!(
        "{} {}",
        quote_identifier(column.name, "column name")?,
        column.column_type.sql_type()
    );
    if column.primary_key {
        definition.push_str(" PRIMARY KEY");
    }
    if !column.nullable {
        definition.push_str(" NOT NULL");
    }
    Ok(definition)
}

/// Constant default for a NOT NULL column added to a populated table.
fn default_literal(column: &ColumnDef) -> String {
    match column.column_type {
        ColumnType::Timestamp => sql_literal(&SqlValue::Timestamp(Utc::now())),
        ColumnType::Jsonb => "'{}'".to_string(),
        ColumnType::Integer | ColumnType::BigInt | ColumnType::Float | ColumnType::Boolean => {
            column.default.as_ref().map(sql_literal).unwrap_or_else(|| "0".to_string())
        }
        ColumnType::Text | ColumnType::Uuid => {
            column.default.as_ref().map(sql_literal).unwrap_or_else(|| "''".to_string())
        }
    }
}

fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Bool(b) => i64::from(*b).to_string(),
        other => {
            let text = other.to_text().unwrap_or_default();
            format!("'{}'", text.replace('\'', "''"))
        }
    }
}

fn insert_query<'a>(table_name: &str, record: &Record) -> StorageResult<QueryBuilder<'a, Sqlite>> {
    if record.is_empty() {
        return Ok(QueryBuilder::new(format!("INSERT INTO {} DEFAULT VALUES", table_name)));
    }

    let columns = record
        .columns()
        .map(|c| quote_identifier(c, "column name"))
        .collect::<StorageResult<Vec<_>>>()?;

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        table_name,
        columns.join(", ")
    ));
    for (i, (_, value)) in record.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_bind_value(&mut builder, value);
    }
    builder.push(")");

    Ok(builder)
}

/// Stored form of the current instant.
fn now_text() -> String {
    format_timestamp(&Utc::now())
}
