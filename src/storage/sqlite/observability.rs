use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;
use tracing::warn;

use super::{count, push_date_range, SqliteStore};
use crate::error::{StorageError, StorageResult};
use crate::storage::identifier::{quote_identifier, validate_field_key};
use crate::storage::pagination::{offset, DateRange, Page, PaginationArgs};
use crate::storage::record::{push_bind_value, Record, SqlValue};
use crate::storage::schema::TableName;
use crate::storage::types::{EvalRow, EvalType, EvalsQuery, LegacyTracesQuery, Trace, TracesQuery};
use crate::storage::{EvalStore, TraceStore, DEFAULT_PAGE_SIZE};

/// `testPath` of an eval's test info, NULL when absent or not JSON.
const TEST_PATH: &str = "CASE WHEN json_valid(test_info) THEN json_extract(test_info, '$.testPath') END";

/// JSON path addressing one top-level attribute key.
fn attribute_path(key: &str) -> StorageResult<String> {
    Ok(format!("$.\"{}\"", validate_field_key(key)?))
}

/// Validated pieces of a trace query, ready to be pushed onto any builder.
struct TraceFilters<'q> {
    query: &'q TracesQuery,
    attributes: Vec<(String, &'q str)>,
    columns: Vec<(String, &'q SqlValue)>,
}

impl<'q> TraceFilters<'q> {
    fn new(query: &'q TracesQuery) -> StorageResult<Self> {
        let attributes = query
            .attributes
            .iter()
            .map(|(key, value)| Ok((attribute_path(key)?, value.as_str())))
            .collect::<StorageResult<Vec<_>>>()?;
        let columns = query
            .filters
            .iter()
            .map(|(key, value)| Ok((quote_identifier(key, "filter key")?, value)))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self {
            query,
            attributes,
            columns,
        })
    }

    fn push(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(name) = &self.query.name {
            builder.push(" AND name LIKE ");
            builder.push_bind(format!("{}%", name));
        }
        if let Some(scope) = &self.query.scope {
            builder.push(" AND scope = ");
            builder.push_bind(scope.clone());
        }
        for (path, value) in &self.attributes {
            builder.push(r#" AND CAST(json_extract("attributes", "#);
            builder.push_bind(path.clone());
            builder.push(") AS TEXT) = ");
            builder.push_bind(value.to_string());
        }
        for (column, value) in &self.columns {
            builder.push(format!(" AND {} = ", column));
            push_bind_value(builder, value);
        }
        push_date_range(
            builder,
            r#""createdAt""#,
            self.query.pagination.date_range.as_ref(),
        );
    }
}

fn trace_from_record(record: &Record) -> Trace {
    Trace {
        id: record.text("id").unwrap_or_default(),
        parent_span_id: record.text("parentSpanId"),
        trace_id: record.text("traceId").unwrap_or_default(),
        name: record.text("name").unwrap_or_default(),
        scope: record.text("scope").unwrap_or_default(),
        kind: record.integer("kind").unwrap_or_default(),
        attributes: record.json("attributes"),
        status: record.json("status"),
        events: record.json("events"),
        links: record.json("links"),
        other: record.text("other"),
        start_time: record.integer("startTime").unwrap_or_default(),
        end_time: record.integer("endTime").unwrap_or_default(),
        created_at: record.timestamp("createdAt").unwrap_or_else(Utc::now),
    }
}

/// Build an eval from a raw row. Unparsable `test_info` is dropped.
fn eval_from_record(record: &Record) -> EvalRow {
    let test_info = record.text("test_info").and_then(|raw| {
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Failed to parse eval test_info");
                None
            }
        }
    });

    EvalRow {
        agent_name: record.text("agent_name").unwrap_or_default(),
        input: record.text("input").unwrap_or_default(),
        output: record.text("output").unwrap_or_default(),
        result: record.json("result").unwrap_or(Value::Null),
        metric_name: record.text("metric_name").unwrap_or_default(),
        instructions: record.text("instructions").unwrap_or_default(),
        test_info,
        global_run_id: record.text("global_run_id").unwrap_or_default(),
        run_id: record.text("run_id").unwrap_or_default(),
        created_at: record.text("created_at").unwrap_or_default(),
    }
}

fn push_eval_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    agent_name: Option<&str>,
    eval_type: Option<EvalType>,
    date_range: Option<&DateRange>,
) {
    if let Some(agent_name) = agent_name {
        builder.push(" AND agent_name = ");
        builder.push_bind(agent_name.to_string());
    }
    match eval_type {
        Some(EvalType::Test) => {
            builder.push(format!(
                " AND (test_info IS NOT NULL AND {} IS NOT NULL)",
                TEST_PATH
            ));
        }
        Some(EvalType::Live) => {
            builder.push(format!(" AND (test_info IS NULL OR {} IS NULL)", TEST_PATH));
        }
        None => {}
    }
    push_date_range(builder, "created_at", date_range);
}

fn eval_type_label(eval_type: Option<EvalType>) -> &'static str {
    match eval_type {
        Some(EvalType::Test) => "test",
        Some(EvalType::Live) => "live",
        None => "all",
    }
}

fn decode_rows<T>(
    rows: &[sqlx::sqlite::SqliteRow],
    f: impl Fn(&Record) -> T,
) -> StorageResult<Vec<T>> {
    rows.iter()
        .map(|row| Record::from_row(row).map(|record| f(&record)))
        .collect()
}

impl SqliteStore {
    async fn query_evals(&self, query: &EvalsQuery, per_page: u32) -> StorageResult<Page<EvalRow>> {
        let table = self.table(TableName::Evals)?;
        let page = query.pagination.page;
        let date_range = query.pagination.date_range.as_ref();

        let mut count_query =
            QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", table));
        push_eval_filters(&mut count_query, query.agent_name.as_deref(), query.eval_type, date_range);
        let total: i64 = count_query.build_query_scalar().fetch_one(self.pool()).await?;

        if total == 0 {
            return Ok(Page::empty(page, per_page));
        }

        let mut data_query =
            QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE 1 = 1", table));
        push_eval_filters(&mut data_query, query.agent_name.as_deref(), query.eval_type, date_range);
        data_query.push(" ORDER BY created_at DESC LIMIT ");
        data_query.push_bind(i64::from(per_page));
        data_query.push(" OFFSET ");
        data_query.push_bind(offset(page, per_page) as i64);

        let rows = data_query.build().fetch_all(self.pool()).await?;
        Ok(Page::new(
            decode_rows(&rows, eval_from_record)?,
            count(total),
            page,
            per_page,
        ))
    }
}

#[async_trait]
impl TraceStore for SqliteStore {
    async fn get_traces_paginated(&self, query: TracesQuery) -> StorageResult<Page<Trace>> {
        let table = self.table(TableName::Traces)?;
        let page = query.pagination.page;
        let per_page = query.pagination.per_page.unwrap_or(DEFAULT_PAGE_SIZE);
        let filters = TraceFilters::new(&query)?;
        let details = || {
            [
                ("name", query.name.clone().unwrap_or_default()),
                ("scope", query.scope.clone().unwrap_or_default()),
            ]
        };

        let mut count_query =
            QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", table));
        filters.push(&mut count_query);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_GET_TRACES_PAGINATED_FAILED_TO_RETRIEVE_TOTAL_COUNT",
                    details(),
                    e,
                )
            })?;

        if total == 0 {
            return Ok(Page::empty(page, per_page));
        }

        let mut data_query =
            QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE 1 = 1", table));
        filters.push(&mut data_query);
        data_query.push(r#" ORDER BY "createdAt" DESC LIMIT "#);
        data_query.push_bind(i64::from(per_page));
        data_query.push(" OFFSET ");
        data_query.push_bind(offset(page, per_page) as i64);

        let rows = data_query
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| {
                StorageError::operation(
                    "STORAGE_SQLITE_GET_TRACES_PAGINATED_FAILED_TO_RETRIEVE_TRACES",
                    details(),
                    e,
                )
            })?;

        Ok(Page::new(
            decode_rows(&rows, trace_from_record)?,
            count(total),
            page,
            per_page,
        ))
    }

    async fn get_traces(&self, query: LegacyTracesQuery) -> StorageResult<Vec<Trace>> {
        let date_range = (query.from_date.is_some() || query.to_date.is_some())
            .then(|| DateRange::new(query.from_date, query.to_date));

        let page = self
            .get_traces_paginated(TracesQuery {
                name: query.name,
                scope: query.scope,
                attributes: query.attributes,
                filters: query.filters,
                pagination: PaginationArgs {
                    page: query.page,
                    per_page: query.per_page,
                    date_range,
                },
            })
            .await?;

        Ok(page.items)
    }
}

#[async_trait]
impl EvalStore for SqliteStore {
    async fn get_evals(&self, query: EvalsQuery) -> StorageResult<Page<EvalRow>> {
        let per_page = query.pagination.per_page.unwrap_or(DEFAULT_PAGE_SIZE);

        self.query_evals(&query, per_page).await.map_err(|e| {
            let err = match e {
                StorageError::Sqlx(source) => StorageError::operation(
                    "STORAGE_SQLITE_GET_EVALS_FAILED",
                    [
                        (
                            "agentName",
                            query.agent_name.clone().unwrap_or_else(|| "all".to_string()),
                        ),
                        ("type", eval_type_label(query.eval_type).to_string()),
                        ("page", query.pagination.page.to_string()),
                        ("perPage", per_page.to_string()),
                    ],
                    source,
                ),
                other => other,
            };
            self.track(&err);
            err
        })
    }

    async fn get_evals_by_agent_name(
        &self,
        agent_name: &str,
        eval_type: Option<EvalType>,
    ) -> StorageResult<Vec<EvalRow>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT * FROM {} WHERE 1 = 1",
            self.table(TableName::Evals)?
        ));
        push_eval_filters(&mut builder, Some(agent_name), eval_type, None);
        builder.push(" ORDER BY created_at DESC");

        let rows = match builder.build().fetch_all(self.pool()).await {
            Ok(rows) => rows,
            Err(e) => {
                let err = StorageError::operation(
                    "STORAGE_SQLITE_GET_EVALS_BY_AGENT_NAME_FAILED",
                    [
                        ("agentName", agent_name.to_string()),
                        ("type", eval_type_label(eval_type).to_string()),
                    ],
                    e,
                );
                if err.is_missing_table() {
                    return Ok(Vec::new());
                }
                self.track(&err);
                return Err(err);
            }
        };

        decode_rows(&rows, eval_from_record)
    }
}
