//! Storage layer for conversational state.
//!
//! This module provides SQLite-based storage for threads, messages,
//! per-resource working memory, workflow run snapshots, traces and evals.
//! Each entity has its own trait; [`SqliteStore`] implements all of them and
//! [`Storage`] names the full set.

mod connection;
mod identifier;
mod merge;
mod pagination;
mod record;
mod schema;
mod sqlite;
mod telemetry;
mod types;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use connection::{Database, SchemaInspector};
pub use identifier::{quote_identifier, validate_field_key, validate_identifier};
pub use merge::{deep_merge, merge_content, merge_metadata};
pub use pagination::{has_more, offset, DateRange, Page, PaginationArgs};
pub use record::{format_timestamp, Record, SqlValue};
pub use schema::{late_columns, table_schema, ColumnDef, ColumnType, TableName};
pub use sqlite::SqliteStore;
pub use telemetry::{ErrorTracker, TracingErrorTracker};
pub use types::*;

#[cfg(test)]
pub use connection::MockSchemaInspector;
#[cfg(test)]
pub use telemetry::MockErrorTracker;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StorageResult;

/// Messages returned when a read does not say how many it wants.
pub const DEFAULT_MESSAGE_LIMIT: u32 = 40;

/// Page size for thread, trace and eval listings.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Thread persistence.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Get a thread by ID.
    async fn get_thread_by_id(&self, thread_id: &str) -> StorageResult<Option<Thread>>;

    /// Every thread of a resource, newest first. Read failures yield `[]`.
    #[deprecated(note = "use get_threads_by_resource_id_paginated")]
    async fn get_threads_by_resource_id(&self, resource_id: &str) -> Vec<Thread>;

    /// One page of a resource's threads, newest first.
    ///
    /// Read failures are reported to the error tracker and yield an empty page.
    async fn get_threads_by_resource_id_paginated(
        &self,
        resource_id: &str,
        pagination: PaginationArgs,
    ) -> Page<Thread>;

    /// Insert or fully overwrite a thread.
    async fn save_thread(&self, thread: &Thread) -> StorageResult<Thread>;

    /// Set the title and merge `metadata` over the stored metadata.
    async fn update_thread(
        &self,
        thread_id: &str,
        title: &str,
        metadata: Map<String, Value>,
    ) -> StorageResult<Thread>;

    /// Delete a thread and all of its messages atomically.
    async fn delete_thread(&self, thread_id: &str) -> StorageResult<()>;
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Recent messages of a thread plus any requested context windows,
    /// oldest first. Read failures yield an empty batch.
    #[deprecated(note = "use get_messages_paginated")]
    async fn get_messages(&self, args: GetMessagesArgs) -> MessageBatch;

    /// A page of a thread's messages plus any requested context windows.
    async fn get_messages_paginated(&self, args: GetMessagesArgs) -> MessagePage;

    /// Upsert messages and touch their thread in one transaction.
    async fn save_messages(
        &self,
        messages: Vec<MessageRecord>,
        format: MessageFormat,
    ) -> StorageResult<MessageBatch>;

    /// Apply sparse patches and return the re-read messages.
    async fn update_messages(&self, patches: Vec<MessagePatch>) -> StorageResult<Vec<MessageV2>>;
}

/// Per-resource working memory.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_resource_by_id(&self, resource_id: &str) -> StorageResult<Option<Resource>>;

    /// Insert a new resource row.
    async fn save_resource(&self, resource: &Resource) -> StorageResult<Resource>;

    /// Update a resource, creating it when absent.
    async fn update_resource(
        &self,
        resource_id: &str,
        working_memory: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> StorageResult<Resource>;
}

/// Workflow run snapshots.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &Value,
    ) -> StorageResult<()>;

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> StorageResult<Option<Value>>;

    async fn get_workflow_runs(&self, query: WorkflowRunsQuery) -> StorageResult<WorkflowRuns>;

    async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> StorageResult<Option<WorkflowRun>>;
}

/// Trace reads.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn get_traces_paginated(&self, query: TracesQuery) -> StorageResult<Page<Trace>>;

    #[deprecated(note = "use get_traces_paginated")]
    async fn get_traces(&self, query: LegacyTracesQuery) -> StorageResult<Vec<Trace>>;
}

/// Eval reads.
#[async_trait]
pub trait EvalStore: Send + Sync {
    async fn get_evals(&self, query: EvalsQuery) -> StorageResult<Page<EvalRow>>;

    /// Evals of one agent, newest first. A missing table yields `[]`.
    #[deprecated(note = "use get_evals")]
    async fn get_evals_by_agent_name(
        &self,
        agent_name: &str,
        eval_type: Option<EvalType>,
    ) -> StorageResult<Vec<EvalRow>>;
}

/// The full storage contract.
pub trait Storage:
    ThreadStore + MessageStore + ResourceStore + WorkflowStore + TraceStore + EvalStore
{
}

impl<T> Storage for T where
    T: ThreadStore + MessageStore + ResourceStore + WorkflowStore + TraceStore + EvalStore
{
}
