//! Polls pending outbox rows and publishes them at-least-once, with
//! exponential backoff and a dead-letter threshold

use crate::broker::Broker;
use crate::event::{CloudEvent, Event};
use crate::row::{OutboxRow, OutboxStatus};
use oms_core::BranchName;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Persists [`OutboxRow`]s and lets the publisher claim the next batch
/// of pending rows per branch (preserving FIFO order within a branch).
pub trait OutboxRepo: Send + Sync {
    /// Pending rows for `branch`, oldest first, capped at `limit`.
    fn pending(&self, branch: &BranchName, limit: usize) -> Vec<OutboxRow>;
    /// Every branch with at least one pending row.
    fn branches_with_pending(&self) -> Vec<BranchName>;
    /// Persist a row's updated state after a publish attempt.
    fn update(&self, row: OutboxRow);
}

/// Turns a raw event payload (the `(event_type, payload)` pair staged
/// by `oms-storage::OutboxDraft`) into a typed [`Event`] for
/// envelope construction. A capability seam so the publisher doesn't
/// need a hard-coded match over every event shape.
pub trait EventDecoder: Send + Sync {
    /// Decode a staged row's payload into a typed event.
    fn decode(&self, event_type: &str, payload: &serde_json::Value) -> Result<Event, String>;
}

/// Decodes using `serde_json`'s externally-tagged representation of
/// [`Event`], i.e. `payload` must already carry the `event_type` tag
/// field `Event`'s `Serialize` impl produces.
pub struct JsonEventDecoder;

impl EventDecoder for JsonEventDecoder {
    fn decode(&self, _event_type: &str, payload: &serde_json::Value) -> Result<Event, String> {
        serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
    }
}

/// Computes `base * 2^attempt`, capped at `max`.
fn backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(max)
}

/// Publishes pending outbox rows to a [`Broker`], marking each
/// `Published` on ack and `Dead` once `max_attempts` is exhausted.
pub struct Publisher {
    repo: Arc<dyn OutboxRepo>,
    broker: Arc<dyn Broker>,
    decoder: Arc<dyn EventDecoder>,
    source: String,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Publisher {
    /// Build a publisher over `repo`, publishing through `broker`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn OutboxRepo>,
        broker: Arc<dyn Broker>,
        decoder: Arc<dyn EventDecoder>,
        source: impl Into<String>,
        batch_size: usize,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Publisher {
            repo,
            broker,
            decoder,
            source: source.into(),
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    /// Run one poll-and-publish pass over every branch with pending rows.
    pub async fn tick(&self) {
        for branch in self.repo.branches_with_pending() {
            for mut row in self.repo.pending(&branch, self.batch_size) {
                self.publish_one(&mut row).await;
                self.repo.update(row);
            }
        }
    }

    async fn publish_one(&self, row: &mut OutboxRow) {
        let wait = backoff(self.backoff_base, row.attempts, self.backoff_max);
        if row.attempts > 0 {
            tokio::time::sleep(wait).await;
        }

        let event = match self.decoder.decode(&row.event_type, &row.payload) {
            Ok(event) => event,
            Err(err) => {
                row.attempts += 1;
                row.last_error = Some(err);
                if row.attempts >= self.max_attempts {
                    row.status = OutboxStatus::Dead;
                }
                return;
            }
        };

        let envelope = CloudEvent::new(self.source.clone(), event);
        let idempotency_key = row.id.to_string();
        match self.broker.publish(&row.event_type, envelope, &idempotency_key).await {
            Ok(()) => {
                row.status = OutboxStatus::Published;
                row.published_at = Some(oms_core::Timestamp::now());
                info!(row_id = %row.id, event_type = %row.event_type, "published outbox row");
            }
            Err(err) => {
                row.attempts += 1;
                row.last_error = Some(err.to_string());
                if row.attempts >= self.max_attempts {
                    row.status = OutboxStatus::Dead;
                    warn!(row_id = %row.id, "outbox row moved to dead letter after exhausting retries");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::event::{BranchCreatedData, Event};
    use parking_lot::Mutex;

    struct FakeRepo {
        rows: Mutex<std::collections::HashMap<uuid::Uuid, OutboxRow>>,
    }

    impl FakeRepo {
        fn new(rows: Vec<OutboxRow>) -> Self {
            FakeRepo {
                rows: Mutex::new(rows.into_iter().map(|r| (r.id, r)).collect()),
            }
        }
    }

    impl OutboxRepo for FakeRepo {
        fn pending(&self, branch: &BranchName, limit: usize) -> Vec<OutboxRow> {
            let mut rows: Vec<_> = self
                .rows
                .lock()
                .values()
                .filter(|r| &r.branch == branch && r.status == OutboxStatus::Pending)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.created_at);
            rows.truncate(limit);
            rows
        }

        fn branches_with_pending(&self) -> Vec<BranchName> {
            self.rows
                .lock()
                .values()
                .filter(|r| r.status == OutboxStatus::Pending)
                .map(|r| r.branch.clone())
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect()
        }

        fn update(&self, row: OutboxRow) {
            self.rows.lock().insert(row.id, row);
        }
    }

    fn sample_row(branch: BranchName) -> OutboxRow {
        let event = Event::BranchCreated(BranchCreatedData {
            branch: branch.clone(),
            parent: None,
            commit_hash: oms_core::CommitHash::compute(b"c"),
            author: "alice".into(),
        });
        let payload = serde_json::to_value(&event).unwrap();
        OutboxRow::new(branch, None, event.type_str(), payload)
    }

    #[tokio::test]
    async fn pending_row_is_published_and_marked() {
        let branch = BranchName::new("main").unwrap();
        let repo = Arc::new(FakeRepo::new(vec![sample_row(branch.clone())]));
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = Publisher::new(
            repo.clone(),
            broker.clone(),
            Arc::new(JsonEventDecoder),
            "oms/test",
            10,
            3,
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        publisher.tick().await;

        let rows = repo.rows.lock();
        let row = rows.values().next().unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.published_at.is_some());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(backoff(base, 0, max), Duration::from_millis(100));
        assert_eq!(backoff(base, 1, max), Duration::from_millis(200));
        assert_eq!(backoff(base, 2, max), Duration::from_millis(400));
        assert_eq!(backoff(base, 10, max), max);
    }
}
