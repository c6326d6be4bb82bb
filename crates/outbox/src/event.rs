//! Event payloads and the CloudEvents v1.0 envelope they travel in

use oms_core::{BranchName, CommitHash, ResourceId, ResourceType, Timestamp};
use serde::{Deserialize, Serialize};

/// One field-level change within a [`SchemaChangedData`] or
/// [`SchemaRevertedData`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetail {
    /// Dotted path of the changed field.
    pub field: String,
    /// The kind of change: `"create"`, `"update"`, or `"delete"`.
    pub operation: String,
    /// Value before the change, if any.
    pub old_value: Option<serde_json::Value>,
    /// Value after the change, if any.
    pub new_value: Option<serde_json::Value>,
    /// Full dotted path, including the resource prefix.
    pub path: String,
    /// Whether this change breaks backward compatibility for consumers.
    pub breaking_change: bool,
}

/// Payload of a `com.oms.schema.changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangedData {
    /// The branch the change landed on.
    pub branch: BranchName,
    /// The commit that produced the change.
    pub commit_hash: CommitHash,
    /// The resource type touched.
    pub resource_type: ResourceType,
    /// The resource touched.
    pub resource_id: ResourceId,
    /// Human-readable name of the resource, if known.
    pub resource_name: Option<String>,
    /// Who made the change.
    pub author: String,
    /// Commit message.
    pub message: String,
    /// The field-level changes.
    pub changes: Vec<ChangeDetail>,
}

/// Payload of a `com.oms.schema.reverted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRevertedData {
    /// The branch the revert landed on.
    pub branch: BranchName,
    /// The commit the branch was reverted from.
    pub reverted_from: CommitHash,
    /// The commit the branch was reverted to.
    pub reverted_to: CommitHash,
    /// What kind of revert this was, e.g. `"single_commit"` or `"range"`.
    pub revert_type: String,
    /// Who performed the revert.
    pub author: String,
    /// The field-level changes, with old/new swapped relative to the
    /// original change being undone.
    pub changes: Vec<ChangeDetail>,
}

/// Payload of a `com.oms.branch.created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCreatedData {
    /// The new branch's name.
    pub branch: BranchName,
    /// The branch it was forked from, if any.
    pub parent: Option<BranchName>,
    /// The commit the new branch starts at.
    pub commit_hash: CommitHash,
    /// Who created the branch.
    pub author: String,
}

/// Payload of a `com.oms.merge.completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCompletedData {
    /// The branch merged from.
    pub source: BranchName,
    /// The branch merged into.
    pub target: BranchName,
    /// The resulting merge commit, if one was created.
    pub merge_commit: Option<CommitHash>,
    /// Number of conflicts encountered.
    pub conflict_count: usize,
    /// Whether the merge auto-resolved every conflict.
    pub auto_resolved: bool,
}

/// Payload of a `com.oms.index.switched` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSwitchedData {
    /// The branch whose index switched.
    pub branch: BranchName,
    /// The shadow index's id.
    pub shadow_id: uuid::Uuid,
    /// Number of records in the promoted index.
    pub record_count: u64,
}

/// Payload of a `com.oms.lock.acquired` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAcquiredData {
    /// The branch locked.
    pub branch: BranchName,
    /// The lock's id.
    pub lock_id: uuid::Uuid,
    /// Who holds the lock.
    pub holder: String,
}

/// Payload of a `com.oms.lock.released` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReleasedData {
    /// The branch unlocked.
    pub branch: BranchName,
    /// The lock's id.
    pub lock_id: uuid::Uuid,
    /// Who released the lock.
    pub holder: String,
}

/// Payload of a `com.oms.lock.auto_released` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAutoReleasedData {
    /// The branch unlocked.
    pub branch: BranchName,
    /// The lock's id.
    pub lock_id: uuid::Uuid,
    /// Who had held the lock.
    pub holder: String,
    /// Why the sweeper released it, e.g. `"expired"` or `"heartbeat_stale"`.
    pub reason: String,
}

/// Every event type the outbox pipeline can produce, one variant per
/// CloudEvents `type` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    /// `com.oms.schema.changed`
    SchemaChanged(SchemaChangedData),
    /// `com.oms.schema.reverted`
    SchemaReverted(SchemaRevertedData),
    /// `com.oms.branch.created`
    BranchCreated(BranchCreatedData),
    /// `com.oms.merge.completed`
    MergeCompleted(MergeCompletedData),
    /// `com.oms.index.switched`
    IndexSwitched(IndexSwitchedData),
    /// `com.oms.lock.acquired`
    LockAcquired(LockAcquiredData),
    /// `com.oms.lock.released`
    LockReleased(LockReleasedData),
    /// `com.oms.lock.auto_released`
    LockAutoReleased(LockAutoReleasedData),
}

impl Event {
    /// The CloudEvents `type` string for this event.
    pub fn type_str(&self) -> &'static str {
        match self {
            Event::SchemaChanged(_) => "com.oms.schema.changed",
            Event::SchemaReverted(_) => "com.oms.schema.reverted",
            Event::BranchCreated(_) => "com.oms.branch.created",
            Event::MergeCompleted(_) => "com.oms.merge.completed",
            Event::IndexSwitched(_) => "com.oms.index.switched",
            Event::LockAcquired(_) => "com.oms.lock.acquired",
            Event::LockReleased(_) => "com.oms.lock.released",
            Event::LockAutoReleased(_) => "com.oms.lock.auto_released",
        }
    }

    /// The branch this event concerns.
    pub fn branch(&self) -> &BranchName {
        match self {
            Event::SchemaChanged(d) => &d.branch,
            Event::SchemaReverted(d) => &d.branch,
            Event::BranchCreated(d) => &d.branch,
            Event::MergeCompleted(d) => &d.target,
            Event::IndexSwitched(d) => &d.branch,
            Event::LockAcquired(d) => &d.branch,
            Event::LockReleased(d) => &d.branch,
            Event::LockAutoReleased(d) => &d.branch,
        }
    }
}

/// A CloudEvents v1.0 envelope wrapping one [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Always `"1.0"`.
    pub specversion: String,
    /// Unique event id, used as the idempotency key downstream.
    pub id: String,
    /// URI identifying the producer, e.g. `"oms/engine"`.
    pub source: String,
    /// The CloudEvents `type`, matching [`Event::type_str`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event occurred, RFC 3339.
    pub time: String,
    /// Content type of `data`; always `"application/json"` here.
    pub datacontenttype: String,
    /// The event payload.
    pub data: Event,
}

impl CloudEvent {
    /// Wrap `event` in a fresh envelope, stamping a new id and the current time.
    pub fn new(source: impl Into<String>, event: Event) -> Self {
        CloudEvent {
            specversion: "1.0".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event.type_str().to_string(),
            time: Timestamp::now().to_rfc3339(),
            datacontenttype: "application/json".to_string(),
            data: event,
        }
    }

    /// Encode to the CloudEvents JSON wire shape.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode from the CloudEvents JSON wire shape, validating that the
    /// required envelope fields (`specversion`, `type`, `source`, `id`)
    /// are present before attempting to parse `data`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        for field in ["specversion", "type", "source", "id"] {
            if value.get(field).is_none() {
                return Err(format!("missing required CloudEvents field: {field}"));
            }
        }
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }
}
