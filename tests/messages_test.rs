//! Integration tests for message storage
//!
//! Covers batch upserts, sparse updates, recent-message reads, context
//! windows around anchor messages and paginated reads.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use convo_store::storage::{
    format_timestamp, GetMessagesArgs, IncludeSpec, MessageBatch, MessageContentV2, MessageFormat,
    MessagePatch, MessageRecord, PaginationArgs, SqliteStore, Thread,
};
use convo_store::{MessageStore, StorageError, ThreadStore};

/// Create an initialised in-memory store for testing
async fn create_test_store() -> SqliteStore {
    let store = SqliteStore::new_in_memory()
        .await
        .expect("Failed to create in-memory store");
    store.init().await.expect("Failed to create tables");
    store
}

fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::hours(2)
}

async fn create_thread(store: &SqliteStore, id: &str) -> Thread {
    let thread = Thread::new("res-1", id)
        .with_id(id)
        .with_created_at(base_time());
    store.save_thread(&thread).await.unwrap();
    thread
}

/// Save `count` messages named `<prefix>1..` one minute apart.
async fn seed_messages(store: &SqliteStore, thread_id: &str, prefix: &str, count: i64) {
    let base = base_time();
    let messages = (1..=count)
        .map(|i| {
            MessageRecord::new(thread_id, "res-1", "user", json!(format!("message {}", i)))
                .with_id(format!("{}{}", prefix, i))
                .with_created_at(base + Duration::minutes(i))
        })
        .collect();
    store.save_messages(messages, MessageFormat::V2).await.unwrap();
}

async fn count_messages(store: &SqliteStore) -> i64 {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    row.0
}

/// Install a trigger that aborts any `event` on `messages` touching `message_id`.
async fn block_message_write(store: &SqliteStore, event: &str, message_id: &str) {
    let sql = format!(
        "CREATE TRIGGER block_{event}_{message_id} BEFORE {event} ON messages \
         WHEN NEW.id = '{message_id}' BEGIN SELECT RAISE(ABORT, 'write blocked'); END",
        event = event,
        message_id = message_id,
    );
    sqlx::query(&sql).execute(store.pool()).await.unwrap();
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod save_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_messages_touches_thread() {
        let store = create_test_store().await;
        let thread = create_thread(&store, "t1").await;

        let saved = store
            .save_messages(
                vec![MessageRecord::new("t1", "res-1", "user", json!("hello")).with_id("m1")],
                MessageFormat::V1,
            )
            .await
            .unwrap();
        assert_eq!(saved.ids(), vec!["m1"]);

        let touched = store.get_thread_by_id("t1").await.unwrap().unwrap();
        assert!(touched.updated_at > thread.updated_at);
    }

    #[tokio::test]
    async fn test_save_messages_returns_parsed_content() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;

        let content = json!({"format": 2, "parts": [{"type": "text", "text": "hi"}]});
        let saved = store
            .save_messages(
                vec![
                    MessageRecord::new("t1", "res-1", "user", content.clone()).with_id("m1"),
                    MessageRecord::new("t1", "res-1", "user", json!("{\"a\":1}"))
                        .with_id("m2")
                        .with_type("v1"),
                ],
                MessageFormat::V1,
            )
            .await
            .unwrap()
            .into_v1()
            .unwrap();

        assert_eq!(saved[0].content, content);
        assert_eq!(saved[0].message_type, None);
        assert_eq!(saved[1].content, json!({"a": 1}));
        assert_eq!(saved[1].message_type.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_save_empty_list() {
        let store = create_test_store().await;

        let saved = store
            .save_messages(Vec::new(), MessageFormat::V2)
            .await
            .unwrap();
        assert!(saved.is_empty());
        assert!(matches!(saved, MessageBatch::V2(_)));
    }

    #[tokio::test]
    async fn test_save_requires_thread_id() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;

        let mut message = MessageRecord::new("t1", "res-1", "user", json!("x")).with_id("m1");
        message.thread_id = None;

        let err = store
            .save_messages(vec![message], MessageFormat::V2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::MissingLinkage {
                field: "threadId",
                ..
            }
        ));
        assert_eq!(err.category(), convo_store::ErrorCategory::User);
    }

    #[tokio::test]
    async fn test_save_requires_resource_id() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;

        let mut message = MessageRecord::new("t1", "res-1", "user", json!("x"));
        message.resource_id = None;

        let err = store
            .save_messages(vec![message], MessageFormat::V2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::MissingLinkage {
                field: "resourceId",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_save_to_missing_thread() {
        let store = create_test_store().await;

        let err = store
            .save_messages(
                vec![MessageRecord::new("ghost", "res-1", "user", json!("x"))],
                MessageFormat::V2,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::ThreadNotFound { ref thread_id } if thread_id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_save_upsert_keeps_created_at() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        let original = base_time();

        store
            .save_messages(
                vec![MessageRecord::new("t1", "res-1", "user", json!("first"))
                    .with_id("m1")
                    .with_created_at(original)],
                MessageFormat::V2,
            )
            .await
            .unwrap();
        store
            .save_messages(
                vec![MessageRecord::new("t1", "res-1", "assistant", json!("second"))
                    .with_id("m1")
                    .with_created_at(Utc::now())],
                MessageFormat::V2,
            )
            .await
            .unwrap();

        #[allow(deprecated)]
        let messages = store
            .get_messages(GetMessagesArgs::new("t1").format(MessageFormat::V1))
            .await
            .into_v1()
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[0].content, json!("second"));
        assert!(messages[0].created_at < original + Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_save_failure_rolls_back_batch() {
        let store = create_test_store().await;
        let thread = create_thread(&store, "t1").await;
        block_message_write(&store, "INSERT", "m2").await;

        let err = store
            .save_messages(
                vec![
                    MessageRecord::new("t1", "res-1", "user", json!("first")).with_id("m1"),
                    MessageRecord::new("t1", "res-1", "user", json!("second")).with_id("m2"),
                ],
                MessageFormat::V2,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_SQLITE_SAVE_MESSAGES_FAILED");

        assert_eq!(count_messages(&store).await, 0);
        let after = store.get_thread_by_id("t1").await.unwrap().unwrap();
        assert_eq!(
            format_timestamp(&after.updated_at),
            format_timestamp(&thread.updated_at)
        );
    }
}

#[cfg(test)]
mod read_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_get_messages_default_limit() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 45).await;

        let messages = store.get_messages(GetMessagesArgs::new("t1")).await;
        assert_eq!(messages.len(), 40);

        let ids = messages.ids();
        assert_eq!(ids.first(), Some(&"m6"));
        assert_eq!(ids.last(), Some(&"m45"));
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_get_messages_last_oldest_first() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 5).await;

        let messages = store
            .get_messages(GetMessagesArgs::new("t1").last(3))
            .await;
        assert_eq!(messages.ids(), vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_context_window_around_anchor() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 10).await;

        // The anchor is requested twice; it must come back once.
        let args = GetMessagesArgs::new("t1")
            .format(MessageFormat::V2)
            .last(0)
            .include(IncludeSpec::new("m5").with_previous(2).with_next(1))
            .include(IncludeSpec::new("m5"));

        let messages = store.get_messages(args).await;
        assert_eq!(messages.ids(), vec!["m4", "m5", "m6", "m7"]);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_context_window_with_recent_messages() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 10).await;

        let args = GetMessagesArgs::new("t1")
            .last(2)
            .include(IncludeSpec::new("m5").with_previous(2).with_next(1));

        let messages = store.get_messages(args).await;
        assert_eq!(messages.ids(), vec!["m4", "m5", "m6", "m7", "m9", "m10"]);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_context_window_from_other_thread() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        create_thread(&store, "t2").await;
        seed_messages(&store, "t1", "a", 3).await;
        seed_messages(&store, "t2", "b", 3).await;

        let args = GetMessagesArgs::new("t1")
            .last(1)
            .include(IncludeSpec::new("b2").in_thread("t2").with_next(1));

        let messages = store.get_messages(args).await;
        let ids = messages.ids();
        assert!(ids.contains(&"b2"));
        assert!(ids.contains(&"b1"));
        assert!(ids.contains(&"a3"));
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_v2_reads_backfill_content() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        store
            .save_messages(
                vec![MessageRecord::new("t1", "res-1", "user", json!("plain text")).with_id("m1")],
                MessageFormat::V2,
            )
            .await
            .unwrap();

        let messages = store
            .get_messages(GetMessagesArgs::new("t1").format(MessageFormat::V2))
            .await
            .into_v2()
            .unwrap();

        assert_eq!(messages[0].content, MessageContentV2::text("plain text"));
        assert_eq!(messages[0].message_type, None);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_get_messages_degrades_without_table() {
        // No init: the messages table does not exist.
        let store = SqliteStore::new_in_memory().await.unwrap();

        let messages = store
            .get_messages(GetMessagesArgs::new("t1").format(MessageFormat::V2))
            .await;
        assert!(messages.is_empty());

        let page = store
            .get_messages_paginated(
                GetMessagesArgs::new("t1").paginate(PaginationArgs::page(2, 5)),
            )
            .await;
        assert!(page.messages.is_empty());
        assert_eq!(page.page, 2);
        assert_eq!(page.per_page, 5);
        assert!(!page.has_more);
    }
}

#[cfg(test)]
mod pagination_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_paginated_pages() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 5).await;

        let first = store
            .get_messages_paginated(
                GetMessagesArgs::new("t1").paginate(PaginationArgs::page(0, 2)),
            )
            .await;
        assert_eq!(first.total, 5);
        assert!(first.has_more);
        assert_eq!(first.messages.ids(), vec!["m4", "m5"]);

        let last = store
            .get_messages_paginated(
                GetMessagesArgs::new("t1").paginate(PaginationArgs::page(2, 2)),
            )
            .await;
        assert_eq!(last.messages.ids(), vec!["m1"]);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_paginated_default_per_page_from_last() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 3).await;

        let page = store
            .get_messages_paginated(GetMessagesArgs::new("t1").last(2))
            .await;
        assert_eq!(page.per_page, 2);
        assert_eq!(page.total, 3);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_paginated_with_include() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 10).await;

        let page = store
            .get_messages_paginated(
                GetMessagesArgs::new("t1")
                    .include(IncludeSpec::new("m2").with_previous(1))
                    .paginate(PaginationArgs::page(0, 2)),
            )
            .await;

        assert_eq!(page.messages.ids(), vec!["m2", "m3", "m9", "m10"]);
        assert_eq!(page.total, 10);
    }
}

#[cfg(test)]
mod update_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_update_merges_content_metadata() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        store
            .save_messages(
                vec![MessageRecord::new(
                    "t1",
                    "res-1",
                    "assistant",
                    json!({"format": 2, "parts": [], "metadata": {"a": 1, "nested": {"x": 1}}}),
                )
                .with_id("m1")],
                MessageFormat::V2,
            )
            .await
            .unwrap();

        let updated = store
            .update_messages(vec![MessagePatch::new("m1").content(object(json!({
                "metadata": {"nested": {"y": 2}, "b": 2}
            })))])
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(
            Value::Object(updated[0].content.metadata.clone().unwrap()),
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}})
        );
        assert_eq!(updated[0].role, "assistant");
    }

    #[tokio::test]
    async fn test_update_moves_message_and_touches_both_threads() {
        let store = create_test_store().await;
        let source = create_thread(&store, "t1").await;
        let target = create_thread(&store, "t2").await;
        seed_messages(&store, "t1", "m", 2).await;

        let before_move = store.get_thread_by_id("t1").await.unwrap().unwrap();
        let updated = store
            .update_messages(vec![MessagePatch::new("m1").move_to_thread("t2").role("system")])
            .await
            .unwrap();

        assert_eq!(updated[0].thread_id, "t2");
        assert_eq!(updated[0].role, "system");

        let t1 = store.get_thread_by_id("t1").await.unwrap().unwrap();
        let t2 = store.get_thread_by_id("t2").await.unwrap().unwrap();
        assert!(t1.updated_at >= before_move.updated_at);
        assert!(t1.updated_at > source.updated_at);
        assert!(t2.updated_at > target.updated_at);

        let moved = store
            .get_messages_paginated(GetMessagesArgs::new("t2"))
            .await;
        assert_eq!(moved.messages.ids(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_update_failure_rolls_back_all_patches() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 2).await;
        block_message_write(&store, "UPDATE", "m2").await;

        let err = store
            .update_messages(vec![
                MessagePatch::new("m1").role("assistant"),
                MessagePatch::new("m2").role("assistant"),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_SQLITE_UPDATE_MESSAGES_FAILED");

        let batch = store
            .get_messages_paginated(GetMessagesArgs::new("t1").format(MessageFormat::V2))
            .await;
        let MessageBatch::V2(messages) = batch.messages else {
            panic!("expected v2 messages");
        };
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role == "user"));
    }

    #[tokio::test]
    async fn test_update_unknown_ids_is_noop() {
        let store = create_test_store().await;

        let updated = store
            .update_messages(vec![MessagePatch::new("ghost").role("user")])
            .await
            .unwrap();
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn test_update_skips_unknown_ids_among_known() {
        let store = create_test_store().await;
        create_thread(&store, "t1").await;
        seed_messages(&store, "t1", "m", 1).await;

        let updated = store
            .update_messages(vec![
                MessagePatch::new("ghost").role("user"),
                MessagePatch::new("m1").role("assistant"),
            ])
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, "m1");
        assert_eq!(updated[0].role, "assistant");
    }
}
