//! Entity types exchanged with callers. No engine types cross this boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::pagination::PaginationArgs;
use super::record::{Record, SqlValue};

/// Message schema tag written when a caller supplies none.
pub const DEFAULT_MESSAGE_TYPE: &str = "v2";

/// A conversation thread owned by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Unique thread identifier.
    pub id: String,
    /// Owning resource.
    pub resource_id: String,
    pub title: String,
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(resource_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            title: title.into(),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

/// Output shape selector for message reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Flat legacy content.
    #[default]
    V1,
    /// Versioned `{format, parts, metadata}` content.
    V2,
}

impl std::str::FromStr for MessageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1" => Ok(MessageFormat::V1),
            "v2" => Ok(MessageFormat::V2),
            _ => Err(format!("Unknown message format: {}", s)),
        }
    }
}

/// Structured content of a version-2 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContentV2 {
    #[serde(default = "default_content_format")]
    pub format: u8,
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Keys this version does not model, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_content_format() -> u8 {
    2
}

impl MessageContentV2 {
    /// Placeholder used when a row has no content.
    pub fn empty() -> Self {
        Self {
            format: 2,
            parts: vec![json!({"type": "text", "text": ""})],
            content: None,
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            format: 2,
            parts: vec![json!({"type": "text", "text": text})],
            content: Some(text),
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Interpret any stored content as version-2 content.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::empty(),
            Value::String(s) if s.is_empty() => Self::empty(),
            Value::String(s) => Self::text(s.clone()),
            Value::Object(map) if map.is_empty() => Self::empty(),
            Value::Object(_) => {
                serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::text(value.to_string()))
            }
            Value::Array(parts) => Self {
                parts: parts.clone(),
                ..Self::empty()
            },
            other => Self::text(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A message as supplied to `save_messages`.
///
/// Thread and resource ids are optional here only so a missing one can be
/// reported; saving a record without both fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: Option<String>,
    pub resource_id: Option<String>,
    pub role: String,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    /// Stored verbatim when it is a JSON string, serialized otherwise.
    pub content: Value,
    pub created_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(
        thread_id: impl Into<String>,
        resource_id: impl Into<String>,
        role: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: Some(thread_id.into()),
            resource_id: Some(resource_id.into()),
            role: role.into(),
            message_type: None,
            content,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

impl From<MessageV2> for MessageRecord {
    fn from(message: MessageV2) -> Self {
        Self {
            id: message.id,
            thread_id: Some(message.thread_id),
            resource_id: message.resource_id,
            role: message.role,
            message_type: message.message_type,
            content: message.content.to_value(),
            created_at: Some(message.created_at),
        }
    }
}

impl From<MessageV1> for MessageRecord {
    fn from(message: MessageV1) -> Self {
        Self {
            id: message.id,
            thread_id: Some(message.thread_id),
            resource_id: message.resource_id,
            role: message.role,
            message_type: message.message_type,
            content: message.content,
            created_at: Some(message.created_at),
        }
    }
}

/// Legacy message shape: content is whatever was stored, parsed if possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageV1 {
    pub id: String,
    pub thread_id: String,
    pub resource_id: Option<String>,
    pub role: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Versioned message shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageV2 {
    pub id: String,
    pub thread_id: String,
    pub resource_id: Option<String>,
    pub role: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub content: MessageContentV2,
    pub created_at: DateTime<Utc>,
}

/// A message row after best-effort content decoding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub resource_id: Option<String>,
    pub role: String,
    pub message_type: Option<String>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    fn into_v1(self) -> MessageV1 {
        MessageV1 {
            id: self.id,
            thread_id: self.thread_id,
            resource_id: self.resource_id,
            role: self.role,
            message_type: self.message_type,
            content: self.content,
            created_at: self.created_at,
        }
    }

    pub(crate) fn into_v2(self) -> MessageV2 {
        MessageV2 {
            content: MessageContentV2::from_value(&self.content),
            id: self.id,
            thread_id: self.thread_id,
            resource_id: self.resource_id,
            role: self.role,
            message_type: self.message_type,
            created_at: self.created_at,
        }
    }
}

/// Messages in the caller's requested shape, produced from one row set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageBatch {
    V1(Vec<MessageV1>),
    V2(Vec<MessageV2>),
}

impl MessageBatch {
    pub(crate) fn from_stored(messages: Vec<StoredMessage>, format: MessageFormat) -> Self {
        match format {
            MessageFormat::V1 => {
                MessageBatch::V1(messages.into_iter().map(StoredMessage::into_v1).collect())
            }
            MessageFormat::V2 => {
                MessageBatch::V2(messages.into_iter().map(StoredMessage::into_v2).collect())
            }
        }
    }

    pub fn empty(format: MessageFormat) -> Self {
        Self::from_stored(Vec::new(), format)
    }

    pub fn len(&self) -> usize {
        match self {
            MessageBatch::V1(messages) => messages.len(),
            MessageBatch::V2(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<&str> {
        match self {
            MessageBatch::V1(messages) => messages.iter().map(|m| m.id.as_str()).collect(),
            MessageBatch::V2(messages) => messages.iter().map(|m| m.id.as_str()).collect(),
        }
    }

    pub fn into_v1(self) -> Option<Vec<MessageV1>> {
        match self {
            MessageBatch::V1(messages) => Some(messages),
            MessageBatch::V2(_) => None,
        }
    }

    pub fn into_v2(self) -> Option<Vec<MessageV2>> {
        match self {
            MessageBatch::V2(messages) => Some(messages),
            MessageBatch::V1(_) => None,
        }
    }
}

/// An anchor message whose neighbours should be returned with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeSpec {
    pub id: String,
    /// Thread holding the anchor, when it differs from the queried thread.
    pub thread_id: Option<String>,
    #[serde(default)]
    pub with_previous_messages: u32,
    #[serde(default)]
    pub with_next_messages: u32,
}

impl IncludeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_previous(mut self, count: u32) -> Self {
        self.with_previous_messages = count;
        self
    }

    pub fn with_next(mut self, count: u32) -> Self {
        self.with_next_messages = count;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectBy {
    /// Number of most recent messages to return.
    pub last: Option<u32>,
    #[serde(default)]
    pub include: Vec<IncludeSpec>,
    pub pagination: Option<PaginationArgs>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesArgs {
    pub thread_id: String,
    pub select_by: Option<SelectBy>,
    #[serde(default)]
    pub format: MessageFormat,
}

impl GetMessagesArgs {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn last(mut self, last: u32) -> Self {
        self.select_by.get_or_insert_with(SelectBy::default).last = Some(last);
        self
    }

    pub fn include(mut self, spec: IncludeSpec) -> Self {
        self.select_by
            .get_or_insert_with(SelectBy::default)
            .include
            .push(spec);
        self
    }

    pub fn paginate(mut self, pagination: PaginationArgs) -> Self {
        self.select_by.get_or_insert_with(SelectBy::default).pagination = Some(pagination);
        self
    }
}

/// A page of messages. `total` and `has_more` describe the paged rows only;
/// anchor context rows ride along without being counted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: MessageBatch,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

/// A sparse update to one message. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    pub id: String,
    pub thread_id: Option<String>,
    pub resource_id: Option<String>,
    pub role: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    /// Merged into the stored content; `metadata` merges recursively.
    pub content: Option<Map<String, Value>>,
}

impl MessagePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn content(mut self, content: Map<String, Value>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn move_to_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.thread_id.is_none()
            && self.resource_id.is_none()
            && self.role.is_none()
            && self.message_type.is_none()
            && self.content.is_none()
    }
}

/// Per-resource working memory and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub working_memory: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            working_memory: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub workflow_name: String,
    pub run_id: String,
    /// Parsed run state; the raw text as a JSON string when it does not parse.
    pub snapshot: Value,
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRuns {
    pub runs: Vec<WorkflowRun>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunsQuery {
    pub workflow_name: Option<String>,
    pub resource_id: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    /// Pagination applies only when both `limit` and `offset` are set.
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// An observability span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub parent_span_id: Option<String>,
    pub trace_id: String,
    pub name: String,
    pub scope: String,
    pub kind: i64,
    pub attributes: Option<Value>,
    pub status: Option<Value>,
    pub events: Option<Value>,
    pub links: Option<Value>,
    pub other: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&Trace> for Record {
    fn from(trace: &Trace) -> Self {
        Record::new()
            .set("id", trace.id.as_str())
            .set("parentSpanId", trace.parent_span_id.clone())
            .set("name", trace.name.as_str())
            .set("traceId", trace.trace_id.as_str())
            .set("scope", trace.scope.as_str())
            .set("kind", trace.kind)
            .set("attributes", trace.attributes.clone())
            .set("status", trace.status.clone())
            .set("events", trace.events.clone())
            .set("links", trace.links.clone())
            .set("other", trace.other.clone())
            .set("startTime", trace.start_time)
            .set("endTime", trace.end_time)
            .set("createdAt", trace.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracesQuery {
    /// Prefix match on the span name.
    pub name: Option<String>,
    pub scope: Option<String>,
    /// Equality on JSON attribute paths.
    pub attributes: BTreeMap<String, String>,
    /// Equality on arbitrary columns.
    pub filters: BTreeMap<String, SqlValue>,
    pub pagination: PaginationArgs,
}

/// Call shape of the deprecated `get_traces`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyTracesQuery {
    pub name: Option<String>,
    pub scope: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub filters: BTreeMap<String, SqlValue>,
    pub page: u32,
    pub per_page: Option<u32>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

/// A recorded evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRow {
    pub agent_name: String,
    pub input: String,
    pub output: String,
    pub result: Value,
    pub metric_name: String,
    pub instructions: String,
    pub test_info: Option<Value>,
    pub global_run_id: String,
    pub run_id: String,
    pub created_at: String,
}

impl From<&EvalRow> for Record {
    fn from(row: &EvalRow) -> Self {
        Record::new()
            .set("input", row.input.as_str())
            .set("output", row.output.as_str())
            .set("result", row.result.clone())
            .set("agent_name", row.agent_name.as_str())
            .set("metric_name", row.metric_name.as_str())
            .set("instructions", row.instructions.as_str())
            .set("test_info", row.test_info.clone())
            .set("global_run_id", row.global_run_id.as_str())
            .set("run_id", row.run_id.as_str())
            .set("created_at", row.created_at.as_str())
    }
}

/// Whether an eval came from a test run or live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalType {
    Test,
    Live,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalsQuery {
    pub agent_name: Option<String>,
    pub eval_type: Option<EvalType>,
    pub pagination: PaginationArgs,
}

/// Optional behaviours this store implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCapabilities {
    pub select_by_include_resource_scope: bool,
    pub resource_working_memory: bool,
}
