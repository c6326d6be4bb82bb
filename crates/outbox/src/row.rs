//! The durable outbox row staged alongside a commit

use oms_core::{BranchName, CommitHash, Timestamp};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`OutboxRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Staged, not yet published.
    Pending,
    /// Successfully published and acknowledged by the broker.
    Published,
    /// Exhausted its retry budget; moved aside for operator attention.
    Dead,
}

/// One row in the durable outbox: an event staged in the same write as
/// the commit that produced it, published at-least-once by
/// [`crate::publisher::Publisher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Unique row id, also used as the broker idempotency key.
    pub id: uuid::Uuid,
    /// The branch the event concerns.
    pub branch: BranchName,
    /// The commit that produced the event, if any (not every event has one).
    pub commit_hash: Option<CommitHash>,
    /// CloudEvents `type` string.
    pub event_type: String,
    /// Event-specific payload, to be wrapped in a `CloudEvent` at publish time.
    pub payload: serde_json::Value,
    /// When the row was staged.
    pub created_at: Timestamp,
    /// When the row was successfully published, if it has been.
    pub published_at: Option<Timestamp>,
    /// Number of publish attempts made so far.
    pub attempts: u32,
    /// Current lifecycle state.
    pub status: OutboxStatus,
    /// The most recent publish error, if any.
    pub last_error: Option<String>,
}

impl OutboxRow {
    /// Stage a new row, unpublished, with zero attempts.
    pub fn new(branch: BranchName, commit_hash: Option<CommitHash>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        OutboxRow {
            id: uuid::Uuid::new_v4(),
            branch,
            commit_hash,
            event_type: event_type.into(),
            payload,
            created_at: Timestamp::now(),
            published_at: None,
            attempts: 0,
            status: OutboxStatus::Pending,
            last_error: None,
        }
    }
}
