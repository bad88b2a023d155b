use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::Sqlite;
use sqlx::QueryBuilder;

use super::SqliteStore;
use crate::error::{StorageError, StorageResult};
use crate::storage::merge::merge_metadata;
use crate::storage::record::{format_timestamp, Record};
use crate::storage::schema::TableName;
use crate::storage::types::Resource;
use crate::storage::ResourceStore;

impl From<&Resource> for Record {
    fn from(resource: &Resource) -> Self {
        Record::new()
            .set("id", resource.id.as_str())
            .set("workingMemory", resource.working_memory.clone())
            .set("metadata", Value::Object(resource.metadata.clone()))
            .set("createdAt", resource.created_at)
            .set("updatedAt", resource.updated_at)
    }
}

/// Build a resource from a raw row.
///
/// `workingMemory` is always surfaced as text, whatever storage class the
/// column value has.
fn resource_from_record(record: &Record) -> Resource {
    let now = Utc::now();
    Resource {
        id: record.text("id").unwrap_or_default(),
        working_memory: record.text("workingMemory"),
        metadata: match record.json("metadata") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        },
        created_at: record.timestamp("createdAt").unwrap_or(now),
        updated_at: record.timestamp("updatedAt").unwrap_or(now),
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get_resource_by_id(&self, resource_id: &str) -> StorageResult<Option<Resource>> {
        let record = self
            .load(TableName::Resources, &Record::new().set("id", resource_id))
            .await?;
        Ok(record.as_ref().map(resource_from_record))
    }

    async fn save_resource(&self, resource: &Resource) -> StorageResult<Resource> {
        self.insert(TableName::Resources, &Record::from(resource))
            .await?;
        Ok(resource.clone())
    }

    async fn update_resource(
        &self,
        resource_id: &str,
        working_memory: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> StorageResult<Resource> {
        let Some(existing) = self.get_resource_by_id(resource_id).await? else {
            let now = Utc::now();
            let resource = Resource {
                id: resource_id.to_string(),
                working_memory,
                metadata: metadata.unwrap_or_default(),
                created_at: now,
                updated_at: now,
            };
            return self.save_resource(&resource).await;
        };

        let updated = Resource {
            working_memory: working_memory.clone().or(existing.working_memory.clone()),
            metadata: merge_metadata(Some(&existing.metadata), metadata.as_ref()),
            updated_at: Utc::now(),
            ..existing
        };

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET ",
            self.table(TableName::Resources)?
        ));
        if let Some(working_memory) = working_memory {
            builder.push(r#""workingMemory" = "#);
            builder.push_bind(working_memory);
            builder.push(", ");
        }
        if metadata.is_some() {
            builder.push("metadata = ");
            builder.push_bind(Value::Object(updated.metadata.clone()).to_string());
            builder.push(", ");
        }
        builder.push(r#""updatedAt" = "#);
        builder.push_bind(format_timestamp(&updated.updated_at));
        builder.push(" WHERE id = ");
        builder.push_bind(resource_id);

        builder.build().execute(self.pool()).await.map_err(|e| {
            StorageError::operation(
                "STORAGE_SQLITE_UPDATE_RESOURCE_FAILED",
                [("resourceId", resource_id.to_string())],
                e,
            )
        })?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::SqlValue;
    use serde_json::json;

    #[test]
    fn test_working_memory_is_always_text() {
        let record = Record::new()
            .set("id", "r1")
            .set("workingMemory", SqlValue::Integer(42))
            .set("metadata", r#"{"plan":"pro"}"#)
            .set("createdAt", "2024-01-01T00:00:00.000000Z")
            .set("updatedAt", "2024-01-01T00:00:00.000000Z");

        let resource = resource_from_record(&record);
        assert_eq!(resource.working_memory.as_deref(), Some("42"));
        assert_eq!(resource.metadata["plan"], "pro");
    }

    #[test]
    fn test_record_from_resource_serializes_metadata() {
        let mut resource = Resource::new("r1");
        resource.metadata.insert("tier".to_string(), json!("gold"));

        let record = Record::from(&resource);
        assert_eq!(record.json("metadata"), Some(json!({"tier": "gold"})));
        assert!(record.get("workingMemory").unwrap().is_null());
    }
}
