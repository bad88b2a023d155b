//! Connection management: the shared pool, schema scoping and transactions.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use super::identifier::{quote_identifier, validate_identifier};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Live schema introspection, queried per call by schema-tolerant operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    /// Whether `column` exists on `table` in the store's schema.
    async fn has_column(&self, table: &str, column: &str) -> StorageResult<bool>;
}

/// A pooled SQLite handle, optionally scoped to a named schema.
///
/// A named schema is an attached database. Every pooled connection attaches
/// it when opened, so qualified table names resolve on any connection.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    schema: Option<String>,
    schema_ready: Arc<OnceCell<()>>,
}

impl Database {
    /// Open a file-backed database.
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());
        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let attach = match config.schema_name.as_deref() {
            Some(schema) => {
                validate_identifier(schema, "schema name")?;
                Some((schema.to_string(), schema_file(&config.path, schema)))
            }
            None => None,
        };

        let pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        Self::open(pool_options, options, attach).await
    }

    /// Open a private in-memory database on a single long-lived connection.
    pub async fn connect_in_memory(schema: Option<&str>) -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?;

        let attach = match schema {
            Some(schema) => {
                validate_identifier(schema, "schema name")?;
                Some((schema.to_string(), ":memory:".to_string()))
            }
            None => None,
        };

        // Every connection would get its own in-memory database, so the pool
        // is pinned to one connection that never expires.
        let pool_options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::open(pool_options, options, attach).await
    }

    async fn open(
        pool_options: SqlitePoolOptions,
        options: SqliteConnectOptions,
        attach: Option<(String, String)>,
    ) -> StorageResult<Self> {
        let schema = attach.as_ref().map(|(schema, _)| schema.clone());

        let pool_options = match attach {
            Some((schema, target)) => pool_options.after_connect(move |conn, _meta| {
                let schema = schema.clone();
                let target = target.clone();
                Box::pin(async move {
                    let sql = format!("ATTACH DATABASE ? AS \"{}\"", schema);
                    sqlx::query(&sql).bind(target).execute(&mut *conn).await?;
                    Ok(())
                })
            }),
            None => pool_options,
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        info!(schema = ?schema, "Database pool opened");

        Ok(Self {
            pool,
            schema,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Fully-qualified, quoted table name.
    pub fn table_name(&self, table: &str) -> StorageResult<String> {
        self.qualify(table, "table name")
    }

    /// Fully-qualified, quoted index name. SQLite places the schema on the
    /// index, not on the indexed table.
    pub fn index_name(&self, index: &str) -> StorageResult<String> {
        self.qualify(index, "index name")
    }

    fn qualify(&self, name: &str, kind: &str) -> StorageResult<String> {
        let quoted = quote_identifier(name, kind)?;
        match self.schema.as_deref() {
            Some(schema) => Ok(format!("{}.{}", quote_identifier(schema, "schema name")?, quoted)),
            None => Ok(quoted),
        }
    }

    /// Begin a transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Confirm the named schema is usable before any DDL touches it.
    ///
    /// Concurrent first callers share one check; a failed check leaves the
    /// cell empty so the next call tries again.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let Some(schema) = self.schema.as_deref() else {
            return Ok(());
        };

        self.schema_ready
            .get_or_try_init(|| async {
                let attached: Option<(String,)> =
                    sqlx::query_as("SELECT name FROM pragma_database_list WHERE name = ?")
                        .bind(schema)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| StorageError::Schema {
                            schema: schema.to_string(),
                            message: e.to_string(),
                        })?;

                if attached.is_none() {
                    error!(schema, "Schema database is not attached");
                    return Err(StorageError::Schema {
                        schema: schema.to_string(),
                        message: "schema database could not be attached; create it manually or \
                                  make its location writable"
                            .to_string(),
                    });
                }

                debug!(schema, "Schema is ready for use");
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Release every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl SchemaInspector for Database {
    async fn has_column(&self, table: &str, column: &str) -> StorageResult<bool> {
        let table = validate_identifier(table, "table name")?;
        let schema = self.schema.as_deref().unwrap_or("main");

        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM pragma_table_info(?, ?) WHERE name = ? COLLATE NOCASE",
        )
        .bind(table)
        .bind(schema)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }
}

/// Location of the attached database backing a named schema.
fn schema_file(main: &Path, schema: &str) -> String {
    let stem = main
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    main.with_file_name(format!("{}-{}.db", stem, schema))
        .display()
        .to_string()
}
