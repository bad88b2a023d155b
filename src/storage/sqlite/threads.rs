use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;

use super::{count, now_text, push_date_range, SqliteStore};
use crate::error::{StorageError, StorageResult};
use crate::storage::merge::merge_metadata;
use crate::storage::pagination::{offset, Page, PaginationArgs};
use crate::storage::record::{format_timestamp, parse_timestamp};
use crate::storage::schema::TableName;
use crate::storage::types::Thread;
use crate::storage::{ThreadStore, DEFAULT_PAGE_SIZE};

const THREAD_COLUMNS: &str = r#"id, "resourceId" AS resource_id, title, metadata, "createdAt" AS created_at, "updatedAt" AS updated_at"#;

impl SqliteStore {
    async fn list_threads(
        &self,
        resource_id: &str,
        pagination: &PaginationArgs,
        per_page: u32,
    ) -> StorageResult<Page<Thread>> {
        let table = self.table(TableName::Threads)?;
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_GET_THREADS_BY_RESOURCE_ID_PAGINATED_FAILED",
                [
                    ("resourceId", resource_id.to_string()),
                    ("page", pagination.page.to_string()),
                ],
                e,
            )
        };

        let mut count_query =
            QueryBuilder::<Sqlite>::new(format!(r#"SELECT COUNT(*) FROM {} WHERE "resourceId" = "#, table));
        count_query.push_bind(resource_id);
        push_date_range(&mut count_query, r#""createdAt""#, pagination.date_range.as_ref());
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(wrap)?;

        if total == 0 {
            return Ok(Page::empty(pagination.page, per_page));
        }

        let mut data_query = QueryBuilder::<Sqlite>::new(format!(
            r#"SELECT {} FROM {} WHERE "resourceId" = "#,
            THREAD_COLUMNS, table
        ));
        data_query.push_bind(resource_id);
        push_date_range(&mut data_query, r#""createdAt""#, pagination.date_range.as_ref());
        data_query.push(r#" ORDER BY "createdAt" DESC LIMIT "#);
        data_query.push_bind(i64::from(per_page));
        data_query.push(" OFFSET ");
        data_query.push_bind(offset(pagination.page, per_page) as i64);

        let rows: Vec<ThreadRow> = data_query
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(wrap)?;

        Ok(Page::new(
            rows.into_iter().map(Thread::from).collect(),
            count(total),
            pagination.page,
            per_page,
        ))
    }

    async fn all_threads(&self, resource_id: &str) -> StorageResult<Vec<Thread>> {
        let sql = format!(
            r#"SELECT {} FROM {} WHERE "resourceId" = ? ORDER BY "createdAt" DESC"#,
            THREAD_COLUMNS,
            self.table(TableName::Threads)?
        );
        let rows: Vec<ThreadRow> = sqlx::query_as(&sql)
            .bind(resource_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_GET_THREADS_BY_RESOURCE_ID_FAILED",
                    [("resourceId", resource_id.to_string())],
                    e,
                )
            })?;

        Ok(rows.into_iter().map(Thread::from).collect())
    }
}

#[async_trait]
impl ThreadStore for SqliteStore {
    async fn get_thread_by_id(&self, thread_id: &str) -> StorageResult<Option<Thread>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            THREAD_COLUMNS,
            self.table(TableName::Threads)?
        );
        let row: Option<ThreadRow> = sqlx::query_as(&sql)
            .bind(thread_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_GET_THREAD_BY_ID_FAILED",
                    [("threadId", thread_id.to_string())],
                    e,
                )
            })?;

        Ok(row.map(Thread::from))
    }

    async fn get_threads_by_resource_id(&self, resource_id: &str) -> Vec<Thread> {
        match self.all_threads(resource_id).await {
            Ok(threads) => threads,
            Err(err) => {
                self.track(&err);
                Vec::new()
            }
        }
    }

    async fn get_threads_by_resource_id_paginated(
        &self,
        resource_id: &str,
        pagination: PaginationArgs,
    ) -> Page<Thread> {
        let per_page = pagination.per_page.unwrap_or(DEFAULT_PAGE_SIZE);
        match self.list_threads(resource_id, &pagination, per_page).await {
            Ok(page) => page,
            Err(err) => {
                self.track(&err);
                Page::empty(pagination.page, per_page)
            }
        }
    }

    async fn save_thread(&self, thread: &Thread) -> StorageResult<Thread> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, "resourceId", title, metadata, "createdAt", "updatedAt")
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                "resourceId" = excluded."resourceId",
                title = excluded.title,
                metadata = excluded.metadata,
                "createdAt" = excluded."createdAt",
                "updatedAt" = excluded."updatedAt"
            "#,
            self.table(TableName::Threads)?
        );
        let metadata = thread
            .metadata
            .as_ref()
            .map(|m| Value::Object(m.clone()).to_string());

        sqlx::query(&sql)
            .bind(&thread.id)
            .bind(&thread.resource_id)
            .bind(&thread.title)
            .bind(metadata)
            .bind(format_timestamp(&thread.created_at))
            .bind(format_timestamp(&thread.updated_at))
            .execute(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_SAVE_THREAD_FAILED",
                    [("threadId", thread.id.clone())],
                    e,
                )
            })?;

        Ok(thread.clone())
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        title: &str,
        metadata: Map<String, Value>,
    ) -> StorageResult<Thread> {
        let existing = self
            .get_thread_by_id(thread_id)
            .await?
            .ok_or_else(|| StorageError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })?;

        let merged = merge_metadata(existing.metadata.as_ref(), Some(&metadata));

        let sql = format!(
            r#"UPDATE {} SET title = ?, metadata = ?, "updatedAt" = ? WHERE id = ? RETURNING {}"#,
            self.table(TableName::Threads)?,
            THREAD_COLUMNS
        );
        let row: ThreadRow = sqlx::query_as(&sql)
            .bind(title)
            .bind(Value::Object(merged).to_string())
            .bind(now_text())
            .bind(thread_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_UPDATE_THREAD_FAILED",
                    [("threadId", thread_id.to_string()), ("title", title.to_string())],
                    e,
                )
            })?;

        Ok(row.into())
    }

    async fn delete_thread(&self, thread_id: &str) -> StorageResult<()> {
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_DELETE_THREAD_FAILED",
                [("threadId", thread_id.to_string())],
                e,
            )
        };
        let messages = format!(
            "DELETE FROM {} WHERE thread_id = ?",
            self.table(TableName::Messages)?
        );
        let threads = format!("DELETE FROM {} WHERE id = ?", self.table(TableName::Threads)?);

        let mut tx = self.db.begin().await?;
        sqlx::query(&messages)
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        sqlx::query(&threads)
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;

        Ok(())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct ThreadRow {
    id: String,
    resource_id: String,
    title: String,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<ThreadRow> for Thread {
    fn from(row: ThreadRow) -> Self {
        Self {
            id: row.id,
            resource_id: row.resource_id,
            title: row.title,
            metadata: row.metadata.and_then(|s| match serde_json::from_str(&s) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}
