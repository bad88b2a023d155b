use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;
use tracing::debug;

use super::{count, push_date_range, SqliteStore};
use crate::error::{StorageError, StorageResult};
use crate::storage::identifier::quote_identifier;
use crate::storage::merge::merge_content;
use crate::storage::pagination::{has_more, offset, PaginationArgs};
use crate::storage::record::{
    format_timestamp, parse_json_lossy, parse_timestamp, push_bind_value, Record,
};
use crate::storage::schema::TableName;
use crate::storage::types::{
    GetMessagesArgs, IncludeSpec, MessageBatch, MessageFormat, MessagePage, MessagePatch,
    MessageRecord, MessageV2, StoredMessage, DEFAULT_MESSAGE_TYPE,
};
use crate::storage::{MessageStore, ThreadStore, DEFAULT_MESSAGE_LIMIT};

const MESSAGE_COLUMNS: &str = r#"id, content, role, type AS message_type, "createdAt" AS created_at, thread_id, "resourceId" AS resource_id"#;

/// Number of rows a read returns when the caller gives no explicit count.
pub(crate) fn resolve_message_limit(last: Option<u32>) -> u32 {
    last.unwrap_or(DEFAULT_MESSAGE_LIMIT)
}

/// Sort oldest first and drop repeated ids, keeping the first occurrence.
fn sort_and_dedup(mut messages: Vec<StoredMessage>) -> Vec<StoredMessage> {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.id.clone()));
    messages
}

impl SqliteStore {
    /// Anchor messages plus their neighbours, oldest first, without repeats.
    ///
    /// Messages of each anchor's thread are ranked newest first with a dense
    /// rank. Previous messages take the ranks just below the anchor's rank,
    /// next messages the ranks just above it.
    pub(crate) async fn include_window(
        &self,
        thread_id: &str,
        include: &[IncludeSpec],
    ) -> StorageResult<Vec<StoredMessage>> {
        if include.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.table(TableName::Messages)?;
        let mut builder = QueryBuilder::<Sqlite>::new("WITH ");

        for (i, spec) in include.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(format!(
                r#"ordered_{} AS (SELECT *, DENSE_RANK() OVER (ORDER BY "createdAt" DESC) AS row_num FROM {} WHERE thread_id = "#,
                i, table
            ));
            builder.push_bind(spec.thread_id.clone().unwrap_or_else(|| thread_id.to_string()));
            builder.push(")");
        }

        for (i, spec) in include.iter().enumerate() {
            if i > 0 {
                builder.push(" UNION ALL ");
            }
            builder.push(format!(
                r#"SELECT m.id, m.content, m.role, m.type AS message_type, m."createdAt" AS created_at, m.thread_id, m."resourceId" AS resource_id
                FROM ordered_{i} m
                WHERE m.id = "#
            ));
            builder.push_bind(spec.id.clone());
            builder.push(format!(
                " OR EXISTS (SELECT 1 FROM ordered_{i} target WHERE target.id = "
            ));
            builder.push_bind(spec.id.clone());
            builder.push(" AND ((m.row_num >= target.row_num - ");
            builder.push_bind(i64::from(spec.with_previous_messages));
            builder.push(" AND m.row_num < target.row_num) OR (m.row_num > target.row_num AND m.row_num <= target.row_num + ");
            builder.push_bind(i64::from(spec.with_next_messages));
            builder.push(")))");
        }
        builder.push(" ORDER BY created_at ASC");

        let rows: Vec<MessageRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(sort_and_dedup(rows.into_iter().map(StoredMessage::from).collect()))
    }

    async fn fetch_messages(&self, args: &GetMessagesArgs) -> StorageResult<Vec<StoredMessage>> {
        let select_by = args.select_by.clone().unwrap_or_default();
        let limit = resolve_message_limit(select_by.last);
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_GET_MESSAGES_FAILED",
                [("threadId", args.thread_id.clone())],
                e,
            )
        };

        let mut rows = self
            .include_window(&args.thread_id, &select_by.include)
            .await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE thread_id = ",
            MESSAGE_COLUMNS,
            self.table(TableName::Messages)?
        ));
        builder.push_bind(args.thread_id.as_str());
        push_exclusions(&mut builder, &rows);
        builder.push(r#" ORDER BY "createdAt" DESC LIMIT "#);
        builder.push_bind(i64::from(limit));

        let remaining: Vec<MessageRow> = builder
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(wrap)?;
        rows.extend(remaining.into_iter().map(StoredMessage::from));

        Ok(sort_and_dedup(rows))
    }

    async fn fetch_message_page(
        &self,
        args: &GetMessagesArgs,
        pagination: &PaginationArgs,
        per_page: u32,
    ) -> StorageResult<MessagePage> {
        let select_by = args.select_by.clone().unwrap_or_default();
        let table = self.table(TableName::Messages)?;
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_GET_MESSAGES_PAGINATED_FAILED",
                [
                    ("threadId", args.thread_id.clone()),
                    ("page", pagination.page.to_string()),
                ],
                e,
            )
        };

        let included = self
            .include_window(&args.thread_id, &select_by.include)
            .await?;

        let mut count_query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE thread_id = ",
            table
        ));
        count_query.push_bind(args.thread_id.as_str());
        push_date_range(&mut count_query, r#""createdAt""#, pagination.date_range.as_ref());
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(wrap)?;

        if total == 0 && included.is_empty() {
            return Ok(MessagePage {
                messages: MessageBatch::empty(args.format),
                total: 0,
                page: pagination.page,
                per_page,
                has_more: false,
            });
        }

        let mut data_query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE thread_id = ",
            MESSAGE_COLUMNS, table
        ));
        data_query.push_bind(args.thread_id.as_str());
        push_date_range(&mut data_query, r#""createdAt""#, pagination.date_range.as_ref());
        push_exclusions(&mut data_query, &included);
        data_query.push(r#" ORDER BY "createdAt" DESC LIMIT "#);
        data_query.push_bind(i64::from(per_page));
        data_query.push(" OFFSET ");
        data_query.push_bind(offset(pagination.page, per_page) as i64);

        let rows: Vec<MessageRow> = data_query
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(wrap)?;

        let total = count(total);
        let more = has_more(pagination.page, per_page, rows.len(), total);

        let mut messages = included;
        messages.extend(rows.into_iter().map(StoredMessage::from));

        Ok(MessagePage {
            messages: MessageBatch::from_stored(sort_and_dedup(messages), args.format),
            total,
            page: pagination.page,
            per_page,
            has_more: more,
        })
    }

    async fn messages_by_id(&self, ids: &[String]) -> StorageResult<Vec<StoredMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE id IN (",
            MESSAGE_COLUMNS,
            self.table(TableName::Messages)?
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(r#") ORDER BY "createdAt" ASC"#);

        let rows: Vec<MessageRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(StoredMessage::from).collect())
    }
}

/// Exclude ids already captured by the context window.
fn push_exclusions(builder: &mut QueryBuilder<'_, Sqlite>, captured: &[StoredMessage]) {
    if captured.is_empty() {
        return;
    }
    builder.push(" AND id NOT IN (");
    let mut separated = builder.separated(", ");
    for message in captured {
        separated.push_bind(message.id.clone());
    }
    separated.push_unseparated(")");
}

/// Column changes a patch asks for, keyed by physical column name.
fn patch_columns(patch: &MessagePatch, current: &StoredMessage) -> Record {
    let mut columns = Record::new();
    if let Some(content) = &patch.content {
        columns.insert("content", merge_content(&current.content, content).to_string());
    }
    if let Some(thread_id) = &patch.thread_id {
        columns.insert("thread_id", thread_id.as_str());
    }
    if let Some(resource_id) = &patch.resource_id {
        columns.insert("resourceId", resource_id.as_str());
    }
    if let Some(role) = &patch.role {
        columns.insert("role", role.as_str());
    }
    if let Some(message_type) = &patch.message_type {
        columns.insert("type", message_type.as_str());
    }
    columns
}

/// Stored text for message content; JSON strings are kept verbatim.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn get_messages(&self, args: GetMessagesArgs) -> MessageBatch {
        match self.fetch_messages(&args).await {
            Ok(rows) => MessageBatch::from_stored(rows, args.format),
            Err(err) => {
                self.track(&err);
                MessageBatch::empty(args.format)
            }
        }
    }

    async fn get_messages_paginated(&self, args: GetMessagesArgs) -> MessagePage {
        let select_by = args.select_by.clone().unwrap_or_default();
        let pagination = select_by.pagination.clone().unwrap_or_default();
        let per_page = pagination
            .per_page
            .unwrap_or_else(|| resolve_message_limit(select_by.last));

        match self.fetch_message_page(&args, &pagination, per_page).await {
            Ok(page) => page,
            Err(err) => {
                self.track(&err);
                MessagePage {
                    messages: MessageBatch::empty(args.format),
                    total: 0,
                    page: pagination.page,
                    per_page: pagination.per_page.unwrap_or(DEFAULT_MESSAGE_LIMIT),
                    has_more: false,
                }
            }
        }
    }

    async fn save_messages(
        &self,
        messages: Vec<MessageRecord>,
        format: MessageFormat,
    ) -> StorageResult<MessageBatch> {
        if messages.is_empty() {
            return Ok(MessageBatch::empty(format));
        }

        let now = Utc::now();
        let mut linked = Vec::with_capacity(messages.len());
        for message in messages {
            let Some(thread_id) = message.thread_id.clone() else {
                return Err(StorageError::MissingLinkage {
                    message_id: message.id,
                    field: "threadId",
                });
            };
            let Some(resource_id) = message.resource_id.clone() else {
                return Err(StorageError::MissingLinkage {
                    message_id: message.id,
                    field: "resourceId",
                });
            };
            linked.push(StoredMessage {
                id: message.id,
                thread_id,
                resource_id: Some(resource_id),
                role: message.role,
                message_type: message.message_type,
                content: message.content,
                created_at: message.created_at.unwrap_or(now),
            });
        }

        let thread_id = linked[0].thread_id.clone();
        if self.get_thread_by_id(&thread_id).await?.is_none() {
            return Err(StorageError::ThreadNotFound { thread_id });
        }

        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_SAVE_MESSAGES_FAILED",
                [
                    ("threadId", thread_id.clone()),
                    ("records", linked.len().to_string()),
                ],
                e,
            )
        };
        let upsert = format!(
            r#"
            INSERT INTO {} (id, thread_id, content, "createdAt", role, type, "resourceId")
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                thread_id = excluded.thread_id,
                content = excluded.content,
                role = excluded.role,
                type = excluded.type,
                "resourceId" = excluded."resourceId"
            "#,
            self.table(TableName::Messages)?
        );
        let touch = format!(
            r#"UPDATE {} SET "updatedAt" = ? WHERE id = ?"#,
            self.table(TableName::Threads)?
        );

        let mut tx = self.db.begin().await?;
        for message in &linked {
            sqlx::query(&upsert)
                .bind(&message.id)
                .bind(&message.thread_id)
                .bind(content_text(&message.content))
                .bind(format_timestamp(&message.created_at))
                .bind(&message.role)
                .bind(message.message_type.as_deref().unwrap_or(DEFAULT_MESSAGE_TYPE))
                .bind(&message.resource_id)
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
        }
        sqlx::query(&touch)
            .bind(format_timestamp(&Utc::now()))
            .bind(&thread_id)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;

        debug!(thread_id = %thread_id, count = linked.len(), "Saved messages");

        let saved = linked
            .into_iter()
            .map(|mut message| {
                if let Value::String(raw) = &message.content {
                    message.content = parse_json_lossy(raw);
                }
                if message.message_type.as_deref() == Some(DEFAULT_MESSAGE_TYPE) {
                    message.message_type = None;
                }
                message
            })
            .collect();

        Ok(MessageBatch::from_stored(saved, format))
    }

    async fn update_messages(&self, patches: Vec<MessagePatch>) -> StorageResult<Vec<MessageV2>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = patches.iter().map(|p| p.id.clone()).collect();
        let existing: HashMap<String, StoredMessage> = self
            .messages_by_id(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        if existing.is_empty() {
            return Ok(Vec::new());
        }

        let messages_table = self.table(TableName::Messages)?;
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_UPDATE_MESSAGES_FAILED",
                [("messageIds", ids.join(","))],
                e,
            )
        };

        let mut statements = Vec::new();
        let mut touched = BTreeSet::new();
        for patch in &patches {
            let Some(current) = existing.get(&patch.id) else {
                continue;
            };
            if patch.is_empty() {
                continue;
            }

            touched.insert(current.thread_id.clone());
            if let Some(thread_id) = &patch.thread_id {
                touched.insert(thread_id.clone());
            }

            let columns = patch_columns(patch, current);
            let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", messages_table));
            for (i, (column, value)) in columns.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(quote_identifier(column, "column name")?);
                builder.push(" = ");
                push_bind_value(&mut builder, value);
            }
            builder.push(" WHERE id = ");
            builder.push_bind(patch.id.clone());
            statements.push(builder);
        }

        let touch = format!(
            r#"UPDATE {} SET "updatedAt" = ? WHERE id = ?"#,
            self.table(TableName::Threads)?
        );
        let now = format_timestamp(&Utc::now());

        let mut tx = self.db.begin().await?;
        for builder in &mut statements {
            builder.build().execute(&mut *tx).await.map_err(wrap)?;
        }
        for thread_id in &touched {
            sqlx::query(&touch)
                .bind(&now)
                .bind(thread_id)
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)?;

        debug!(messages = statements.len(), threads = touched.len(), "Updated messages");

        let updated = self.messages_by_id(&ids).await?;
        Ok(updated.into_iter().map(StoredMessage::into_v2).collect())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    content: Option<String>,
    role: String,
    message_type: Option<String>,
    created_at: String,
    thread_id: String,
    resource_id: Option<String>,
}

impl From<MessageRow> for StoredMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            thread_id: row.thread_id,
            resource_id: row.resource_id,
            role: row.role,
            message_type: row.message_type.filter(|t| t != DEFAULT_MESSAGE_TYPE),
            content: row
                .content
                .map(|raw| parse_json_lossy(&raw))
                .unwrap_or(Value::Null),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
