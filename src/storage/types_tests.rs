//! Unit tests for storage types and builder patterns.
//!
//! Covers content backfill, batch shaping, request builders and the
//! wire names callers rely on.

use super::*;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

fn stored(id: &str, content: serde_json::Value) -> types::StoredMessage {
    types::StoredMessage {
        id: id.to_string(),
        thread_id: "t1".to_string(),
        resource_id: Some("r1".to_string()),
        role: "user".to_string(),
        message_type: None,
        content,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

// ============================================================================
// Thread tests
// ============================================================================

#[test]
fn test_thread_new() {
    let thread = Thread::new("res-1", "Planning");
    assert!(!thread.id.is_empty());
    assert_eq!(thread.resource_id, "res-1");
    assert_eq!(thread.title, "Planning");
    assert!(thread.metadata.is_none());
    assert_eq!(thread.created_at, thread.updated_at);
}

#[test]
fn test_thread_serializes_camel_case() {
    let thread = Thread::new("res-1", "t").with_id("t1");
    let value = serde_json::to_value(&thread).unwrap();
    assert_eq!(value["resourceId"], "res-1");
    assert!(value.get("createdAt").is_some());
    assert!(value.get("resource_id").is_none());
}

// ============================================================================
// Content backfill tests
// ============================================================================

#[test]
fn test_content_backfill_placeholder() {
    let placeholder = MessageContentV2::empty();
    assert_eq!(MessageContentV2::from_value(&json!(null)), placeholder);
    assert_eq!(MessageContentV2::from_value(&json!("")), placeholder);
    assert_eq!(MessageContentV2::from_value(&json!({})), placeholder);
    assert_eq!(placeholder.parts, vec![json!({"type": "text", "text": ""})]);
}

#[test]
fn test_content_backfill_from_string() {
    let content = MessageContentV2::from_value(&json!("hello"));
    assert_eq!(content.format, 2);
    assert_eq!(content.parts, vec![json!({"type": "text", "text": "hello"})]);
    assert_eq!(content.content.as_deref(), Some("hello"));
}

#[test]
fn test_content_backfill_from_parts_array() {
    let parts = json!([{"type": "text", "text": "a"}, {"type": "image", "url": "x"}]);
    let content = MessageContentV2::from_value(&parts);
    assert_eq!(content.parts.len(), 2);
    assert_eq!(content.parts[1]["type"], "image");
}

#[test]
fn test_content_keeps_unknown_keys() {
    let value = json!({
        "format": 2,
        "parts": [],
        "toolInvocations": [{"id": "call-1"}]
    });
    let content = MessageContentV2::from_value(&value);
    assert_eq!(content.extra["toolInvocations"][0]["id"], "call-1");
    assert_eq!(content.to_value(), value);
}

// ============================================================================
// MessageBatch tests
// ============================================================================

#[test]
fn test_batch_from_stored_v1_keeps_raw_content() {
    let batch = MessageBatch::from_stored(vec![stored("m1", json!("plain"))], MessageFormat::V1);
    assert_eq!(batch.len(), 1);
    let messages = batch.into_v1().unwrap();
    assert_eq!(messages[0].content, json!("plain"));
}

#[test]
fn test_batch_from_stored_v2_backfills() {
    let batch = MessageBatch::from_stored(
        vec![stored("m1", json!("plain")), stored("m2", json!(null))],
        MessageFormat::V2,
    );
    assert_eq!(batch.ids(), vec!["m1", "m2"]);

    let messages = batch.clone().into_v2().unwrap();
    assert_eq!(messages[0].content.content.as_deref(), Some("plain"));
    assert_eq!(messages[1].content, MessageContentV2::empty());
    assert!(batch.into_v1().is_none());
}

#[test]
fn test_empty_batch() {
    let batch = MessageBatch::empty(MessageFormat::V2);
    assert!(batch.is_empty());
    assert!(matches!(batch, MessageBatch::V2(_)));
}

#[test]
fn test_message_format_from_str() {
    assert_eq!("V2".parse::<MessageFormat>().unwrap(), MessageFormat::V2);
    assert_eq!("v1".parse::<MessageFormat>().unwrap(), MessageFormat::V1);
    assert!("v3".parse::<MessageFormat>().is_err());
    assert_eq!(MessageFormat::default(), MessageFormat::V1);
}

// ============================================================================
// Request builder tests
// ============================================================================

#[test]
fn test_include_spec_builder() {
    let spec = IncludeSpec::new("m5")
        .in_thread("other")
        .with_previous(2)
        .with_next(1);
    assert_eq!(spec.id, "m5");
    assert_eq!(spec.thread_id.as_deref(), Some("other"));
    assert_eq!(spec.with_previous_messages, 2);
    assert_eq!(spec.with_next_messages, 1);
}

#[test]
fn test_get_messages_args_builder() {
    let args = GetMessagesArgs::new("t1")
        .format(MessageFormat::V2)
        .last(5)
        .include(IncludeSpec::new("m1"))
        .include(IncludeSpec::new("m2"))
        .paginate(PaginationArgs::page(1, 10));

    let select_by = args.select_by.unwrap();
    assert_eq!(select_by.last, Some(5));
    assert_eq!(select_by.include.len(), 2);
    assert_eq!(select_by.pagination, Some(PaginationArgs::page(1, 10)));
}

#[test]
fn test_get_messages_args_deserialize() {
    let args: GetMessagesArgs = serde_json::from_value(json!({
        "threadId": "t1",
        "selectBy": {
            "last": 3,
            "include": [{"id": "m1", "withPreviousMessages": 1}]
        }
    }))
    .unwrap();

    assert_eq!(args.format, MessageFormat::V1);
    let include = &args.select_by.unwrap().include[0];
    assert_eq!(include.with_previous_messages, 1);
    assert_eq!(include.with_next_messages, 0);
}

#[test]
fn test_message_patch_is_empty() {
    assert!(MessagePatch::new("m1").is_empty());
    assert!(!MessagePatch::new("m1").role("assistant").is_empty());
    assert!(!MessagePatch::new("m1").move_to_thread("t2").is_empty());
}

#[test]
fn test_message_record_type_field_name() {
    let record = MessageRecord::new("t1", "r1", "user", json!("hi")).with_type("v2");
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["type"], "v2");
    assert_eq!(value["threadId"], "t1");
}

#[test]
fn test_message_record_from_v2() {
    let message = MessageV2 {
        id: "m1".to_string(),
        thread_id: "t1".to_string(),
        resource_id: None,
        role: "assistant".to_string(),
        message_type: None,
        content: MessageContentV2::text("ok"),
        created_at: Utc::now(),
    };

    let record = MessageRecord::from(message);
    assert_eq!(record.thread_id.as_deref(), Some("t1"));
    assert_eq!(record.content["parts"][0]["text"], "ok");
}

// ============================================================================
// Eval and trace tests
// ============================================================================

#[test]
fn test_eval_row_record_uses_column_names() {
    let row = EvalRow {
        agent_name: "agent".to_string(),
        input: "in".to_string(),
        output: "out".to_string(),
        result: json!({"score": 1}),
        metric_name: "accuracy".to_string(),
        instructions: String::new(),
        test_info: None,
        global_run_id: "g1".to_string(),
        run_id: "r1".to_string(),
        created_at: "2024-01-01T00:00:00.000000Z".to_string(),
    };

    let record = Record::from(&row);
    assert_eq!(record.text("agent_name").as_deref(), Some("agent"));
    assert!(record.get("test_info").unwrap().is_null());

    let value = serde_json::to_value(&row).unwrap();
    assert_eq!(value["agentName"], "agent");
    assert_eq!(value["globalRunId"], "g1");
}

#[test]
fn test_eval_type_serde() {
    assert_eq!(serde_json::to_value(EvalType::Live).unwrap(), json!("live"));
    assert_eq!(
        serde_json::from_value::<EvalType>(json!("test")).unwrap(),
        EvalType::Test
    );
}
