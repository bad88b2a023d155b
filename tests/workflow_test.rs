//! Integration tests for workflow run snapshots

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use convo_store::storage::{SqliteStore, WorkflowRunsQuery};
use convo_store::WorkflowStore;

/// Create an initialised in-memory store for testing
async fn create_test_store() -> SqliteStore {
    let store = SqliteStore::new_in_memory()
        .await
        .expect("Failed to create in-memory store");
    store.init().await.expect("Failed to create tables");
    store
}

#[tokio::test]
async fn test_persist_and_load_snapshot() {
    let store = create_test_store().await;
    let snapshot = json!({"status": "running", "steps": {"fetch": {"status": "success"}}});

    store
        .persist_workflow_snapshot("ingest", "run-1", None, &snapshot)
        .await
        .unwrap();

    let loaded = store.load_workflow_snapshot("ingest", "run-1").await.unwrap();
    assert_eq!(loaded, Some(snapshot));
}

#[tokio::test]
async fn test_load_missing_snapshot() {
    let store = create_test_store().await;

    let loaded = store.load_workflow_snapshot("ingest", "nope").await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn test_persist_replaces_snapshot() {
    let store = create_test_store().await;

    store
        .persist_workflow_snapshot("ingest", "run-1", Some("res-1"), &json!({"status": "running"}))
        .await
        .unwrap();
    let first = store
        .get_workflow_run_by_id("run-1", Some("ingest"))
        .await
        .unwrap()
        .unwrap();

    store
        .persist_workflow_snapshot("ingest", "run-1", None, &json!({"status": "success"}))
        .await
        .unwrap();

    let runs = store
        .get_workflow_runs(WorkflowRunsQuery::default())
        .await
        .unwrap();
    assert_eq!(runs.total, 1);

    let run = &runs.runs[0];
    assert_eq!(run.snapshot, json!({"status": "success"}));
    assert_eq!(run.resource_id.as_deref(), Some("res-1"));
    assert_eq!(run.created_at, first.created_at);
    assert!(run.updated_at >= first.updated_at);
}

#[tokio::test]
async fn test_get_workflow_runs_filters() {
    let store = create_test_store().await;

    store
        .persist_workflow_snapshot("ingest", "run-1", Some("res-1"), &json!({}))
        .await
        .unwrap();
    store
        .persist_workflow_snapshot("ingest", "run-2", Some("res-2"), &json!({}))
        .await
        .unwrap();
    store
        .persist_workflow_snapshot("report", "run-3", Some("res-1"), &json!({}))
        .await
        .unwrap();

    let by_name = store
        .get_workflow_runs(WorkflowRunsQuery {
            workflow_name: Some("ingest".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_name.total, 2);
    assert!(by_name.runs.iter().all(|r| r.workflow_name == "ingest"));

    let by_resource = store
        .get_workflow_runs(WorkflowRunsQuery {
            resource_id: Some("res-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut run_ids: Vec<&str> = by_resource.runs.iter().map(|r| r.run_id.as_str()).collect();
    run_ids.sort();
    assert_eq!(run_ids, vec!["run-1", "run-3"]);

    let future = store
        .get_workflow_runs(WorkflowRunsQuery {
            from_date: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(future.total, 0);
}

#[tokio::test]
async fn test_get_workflow_runs_pagination() {
    let store = create_test_store().await;

    for i in 0..5 {
        store
            .persist_workflow_snapshot("ingest", &format!("run-{}", i), None, &json!({"i": i}))
            .await
            .unwrap();
    }

    let page = store
        .get_workflow_runs(WorkflowRunsQuery {
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.runs.len(), 2);

    // A limit without an offset does not paginate.
    let unpaged = store
        .get_workflow_runs(WorkflowRunsQuery {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(unpaged.runs.len(), 5);
    assert_eq!(unpaged.total, 5);
}

#[tokio::test]
async fn test_get_workflow_run_by_id() {
    let store = create_test_store().await;

    store
        .persist_workflow_snapshot("ingest", "shared", None, &json!({"from": "ingest"}))
        .await
        .unwrap();
    store
        .persist_workflow_snapshot("report", "shared", None, &json!({"from": "report"}))
        .await
        .unwrap();

    let run = store
        .get_workflow_run_by_id("shared", Some("report"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.workflow_name, "report");
    assert_eq!(run.snapshot, json!({"from": "report"}));

    assert!(store
        .get_workflow_run_by_id("missing", None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_snapshots_in_named_schema() {
    let store = SqliteStore::new_in_memory_with_schema("tenant_a")
        .await
        .unwrap();
    store.init().await.unwrap();

    store
        .persist_workflow_snapshot("ingest", "run-1", Some("res-1"), &json!({"ok": true}))
        .await
        .unwrap();

    let run = store
        .get_workflow_run_by_id("run-1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.resource_id.as_deref(), Some("res-1"));

    let in_schema: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM "tenant_a"."workflow_snapshot""#)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(in_schema.0, 1);
}
