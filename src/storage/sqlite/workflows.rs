use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;
use tracing::warn;

use super::{count, insert_query, parse_snapshot, push_date_range, SqliteStore};
use crate::error::{StorageError, StorageResult};
use crate::storage::pagination::DateRange;
use crate::storage::record::Record;
use crate::storage::schema::TableName;
use crate::storage::types::{WorkflowRun, WorkflowRuns, WorkflowRunsQuery};
use crate::storage::WorkflowStore;

const RESOURCE_COLUMN: &str = "resourceId";

fn workflow_run_from_record(record: &Record) -> WorkflowRun {
    let now = Utc::now();
    let workflow_name = record.text("workflow_name").unwrap_or_default();
    let snapshot = match record.text("snapshot") {
        Some(raw) => parse_snapshot(&raw, Some(&workflow_name)),
        None => Value::Null,
    };

    WorkflowRun {
        run_id: record.text("run_id").unwrap_or_default(),
        snapshot,
        resource_id: record.text(RESOURCE_COLUMN),
        created_at: record.timestamp("createdAt").unwrap_or(now),
        updated_at: record.timestamp("updatedAt").unwrap_or(now),
        workflow_name,
    }
}

fn push_run_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    query: &WorkflowRunsQuery,
    resource_id: Option<&str>,
    date_range: &DateRange,
) {
    if let Some(workflow_name) = &query.workflow_name {
        builder.push(" AND workflow_name = ");
        builder.push_bind(workflow_name.clone());
    }
    if let Some(resource_id) = resource_id {
        builder.push(r#" AND "resourceId" = "#);
        builder.push_bind(resource_id.to_string());
    }
    push_date_range(builder, r#""createdAt""#, Some(date_range));
}

impl SqliteStore {
    /// Whether `workflow_snapshot` has the late-added resource column.
    async fn snapshot_has_resource_column(&self) -> StorageResult<bool> {
        self.inspector
            .has_column(TableName::WorkflowSnapshot.as_str(), RESOURCE_COLUMN)
            .await
    }

    async fn query_workflow_runs(&self, query: &WorkflowRunsQuery) -> StorageResult<WorkflowRuns> {
        let table = self.table(TableName::WorkflowSnapshot)?;

        let resource_id = match query.resource_id.as_deref() {
            Some(resource_id) if self.snapshot_has_resource_column().await? => Some(resource_id),
            Some(_) => {
                warn!(
                    table = TableName::WorkflowSnapshot.as_str(),
                    "resourceId column not found, skipping resourceId filter"
                );
                None
            }
            None => None,
        };
        let date_range = DateRange::new(query.from_date, query.to_date);

        let paginate = match (query.limit, query.offset) {
            (Some(limit), Some(offset)) => Some((limit, offset)),
            _ => None,
        };

        let mut total = None;
        if paginate.is_some() {
            let mut count_query =
                QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", table));
            push_run_filters(&mut count_query, query, resource_id, &date_range);
            let value: i64 = count_query.build_query_scalar().fetch_one(self.pool()).await?;
            total = Some(count(value));
        }

        let mut data_query =
            QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE 1 = 1", table));
        push_run_filters(&mut data_query, query, resource_id, &date_range);
        data_query.push(r#" ORDER BY "createdAt" DESC"#);
        if let Some((limit, offset)) = paginate {
            data_query.push(" LIMIT ");
            data_query.push_bind(i64::from(limit));
            data_query.push(" OFFSET ");
            data_query.push_bind(i64::from(offset));
        }

        let rows = data_query.build().fetch_all(self.pool()).await?;
        let runs = rows
            .iter()
            .map(|row| Record::from_row(row).map(|record| workflow_run_from_record(&record)))
            .collect::<StorageResult<Vec<_>>>()?;

        let total = total.unwrap_or(runs.len() as u64);
        Ok(WorkflowRuns { runs, total })
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &Value,
    ) -> StorageResult<()> {
        let wrap = |e: sqlx::Error| {
            StorageError::operation(
                "STORAGE_SQLITE_PERSIST_WORKFLOW_SNAPSHOT_FAILED",
                [
                    ("workflowName", workflow_name.to_string()),
                    ("runId", run_id.to_string()),
                ],
                e,
            )
        };

        let resource_id = match resource_id {
            Some(resource_id) if self.snapshot_has_resource_column().await? => Some(resource_id),
            Some(_) => {
                warn!(
                    workflow_name,
                    run_id, "resourceId column not found, snapshot saved without it"
                );
                None
            }
            None => None,
        };

        let now = Utc::now();
        let mut record = Record::new()
            .set("workflow_name", workflow_name)
            .set("run_id", run_id);
        if let Some(resource_id) = resource_id {
            record.insert(RESOURCE_COLUMN, resource_id);
        }
        let record = record
            .set("snapshot", snapshot.to_string())
            .set("createdAt", now)
            .set("updatedAt", now);

        let mut builder = insert_query(&self.table(TableName::WorkflowSnapshot)?, &record)?;
        builder.push(
            r#" ON CONFLICT (workflow_name, run_id) DO UPDATE SET snapshot = excluded.snapshot, "updatedAt" = excluded."updatedAt""#,
        );
        if resource_id.is_some() {
            builder.push(r#", "resourceId" = excluded."resourceId""#);
        }
        builder.build().execute(self.pool()).await.map_err(wrap)?;

        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> StorageResult<Option<Value>> {
        let keys = Record::new()
            .set("workflow_name", workflow_name)
            .set("run_id", run_id);
        let record = self.load(TableName::WorkflowSnapshot, &keys).await?;
        Ok(record.and_then(|r| r.get("snapshot").map(|v| v.to_json())))
    }

    async fn get_workflow_runs(&self, query: WorkflowRunsQuery) -> StorageResult<WorkflowRuns> {
        self.query_workflow_runs(&query).await.map_err(|e| match e {
            StorageError::Sqlx(source) => StorageError::operation(
                "STORAGE_SQLITE_GET_WORKFLOW_RUNS_FAILED",
                [(
                    "workflowName",
                    query.workflow_name.clone().unwrap_or_else(|| "all".to_string()),
                )],
                source,
            ),
            other => other,
        })
    }

    async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> StorageResult<Option<WorkflowRun>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT * FROM {} WHERE run_id = ",
            self.table(TableName::WorkflowSnapshot)?
        ));
        builder.push_bind(run_id);
        if let Some(workflow_name) = workflow_name {
            builder.push(" AND workflow_name = ");
            builder.push_bind(workflow_name);
        }
        builder.push(r#" ORDER BY "createdAt" DESC LIMIT 1"#);

        let row = builder
            .build()
            .fetch_optional(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_GET_WORKFLOW_RUN_BY_ID_FAILED",
                    [
                        ("runId", run_id.to_string()),
                        ("workflowName", workflow_name.unwrap_or_default().to_string()),
                    ],
                    e,
                )
            })?;

        match row {
            Some(row) => Ok(Some(workflow_run_from_record(&Record::from_row(&row)?))),
            None => Ok(None),
        }
    }
}
