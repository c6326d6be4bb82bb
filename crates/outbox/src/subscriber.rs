//! At-least-once event subscriber: validates, routes, derives audit
//! records, and dedupes by CloudEvents id

use crate::broker::{Broker, Delivery};
use crate::compliance::{derive_severity, AuditSeverity, ComplianceTagger};
use crate::event::{CloudEvent, Event};
use dashmap::DashMap;
use oms_core::{BranchName, CommitHash, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One entry in a resource's change history, derived from a
/// `schema.changed` or `schema.reverted` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The commit that produced this entry.
    pub commit_hash: CommitHash,
    /// The branch the change landed on.
    pub branch: BranchName,
    /// When the change was recorded.
    pub timestamp: Timestamp,
    /// Who made the change.
    pub author: String,
    /// Author's email, if known.
    pub author_email: Option<String>,
    /// Commit message.
    pub message: String,
    /// `"create"`, `"update"`, `"delete"`, or `"revert"`.
    pub operation: String,
    /// The resource type touched.
    pub resource_type: String,
    /// The resource touched.
    pub resource_id: String,
    /// Human-readable name of the resource, if known.
    pub resource_name: Option<String>,
    /// The field-level changes.
    pub changes: Vec<crate::event::ChangeDetail>,
    /// `changes.len()`.
    pub total_changes: usize,
    /// Count of changes marked `breaking_change`. Always 0 for reverts.
    pub breaking_changes: usize,
    /// Free-form metadata, e.g. the originating CloudEvents id.
    pub metadata: serde_json::Value,
}

/// One entry in the compliance audit log, derived from any event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// `SCHEMA_CHANGE`, `SCHEMA_REVERT`, or `SCHEMA_VALIDATION`.
    pub event_type: String,
    /// The branch concerned.
    pub branch: BranchName,
    /// The resource type concerned.
    pub resource_type: String,
    /// The resource concerned.
    pub resource_id: String,
    /// Who performed the action.
    pub actor: String,
    /// Derived severity.
    pub severity: AuditSeverity,
    /// Derived compliance tags.
    pub compliance_tags: Vec<String>,
    /// Derived data classification.
    pub data_classification: String,
    /// SIEM-facing numeric severity.
    pub siem_severity: u8,
    /// When the entry was recorded.
    pub timestamp: Timestamp,
}

/// A message that failed processing and was moved aside for operator attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Which queue produced this entry: `"parse"` for malformed
    /// envelopes, `"processing"` for handler failures.
    pub source: String,
    /// The raw payload that failed.
    pub original_payload: serde_json::Value,
    /// The error that caused the failure.
    pub error: String,
    /// When the first failure occurred.
    pub first_failed_at: Timestamp,
    /// Number of attempts made before giving up.
    pub attempts: u32,
}

/// Persists derived [`HistoryEntry`] rows. A capability interface so
/// tests run against an in-memory fake.
pub trait HistoryRepo: Send + Sync {
    /// Append a history entry.
    fn append(&self, entry: HistoryEntry);
}

/// Persists derived [`AuditLogEntry`] rows and forwards to a SIEM.
pub trait AuditRepo: Send + Sync {
    /// Append an audit log entry.
    fn append(&self, entry: AuditLogEntry);
    /// Forward an entry to an external SIEM, scored by its `siem_severity`.
    fn send_to_siem(&self, entry: &AuditLogEntry);
}

/// Persists [`DlqEntry`] rows for both the parse-DLQ and processing-DLQ.
pub trait DlqRepo: Send + Sync {
    /// Append a dead-letter entry.
    fn append(&self, entry: DlqEntry);
}

/// In-memory fakes for the three repo traits, used in tests.
pub struct InMemorySinks {
    /// Recorded history entries.
    pub history: parking_lot::Mutex<Vec<HistoryEntry>>,
    /// Recorded audit entries.
    pub audit: parking_lot::Mutex<Vec<AuditLogEntry>>,
    /// Entries sent to the fake SIEM.
    pub siem: parking_lot::Mutex<Vec<AuditLogEntry>>,
    /// Recorded DLQ entries.
    pub dlq: parking_lot::Mutex<Vec<DlqEntry>>,
}

impl InMemorySinks {
    /// Empty sinks.
    pub fn new() -> Self {
        InMemorySinks {
            history: parking_lot::Mutex::new(Vec::new()),
            audit: parking_lot::Mutex::new(Vec::new()),
            siem: parking_lot::Mutex::new(Vec::new()),
            dlq: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemorySinks {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRepo for InMemorySinks {
    fn append(&self, entry: HistoryEntry) {
        self.history.lock().push(entry);
    }
}

impl AuditRepo for InMemorySinks {
    fn append(&self, entry: AuditLogEntry) {
        self.audit.lock().push(entry);
    }

    fn send_to_siem(&self, entry: &AuditLogEntry) {
        self.siem.lock().push(entry.clone());
    }
}

impl DlqRepo for InMemorySinks {
    fn append(&self, entry: DlqEntry) {
        self.dlq.lock().push(entry);
    }
}

/// Subscribes to the outbox's published topics, validates each
/// envelope, derives history/audit records, and dedupes by CloudEvents
/// id within a configurable window.
pub struct Subscriber {
    history_repo: Arc<dyn HistoryRepo>,
    audit_repo: Arc<dyn AuditRepo>,
    dlq_repo: Arc<dyn DlqRepo>,
    tagger: Arc<dyn ComplianceTagger>,
    seen: DashMap<String, Timestamp>,
    idempotency_window: Duration,
    max_handler_attempts: u32,
}

impl Subscriber {
    /// Build a subscriber wired to the given repos and tagger.
    pub fn new(
        history_repo: Arc<dyn HistoryRepo>,
        audit_repo: Arc<dyn AuditRepo>,
        dlq_repo: Arc<dyn DlqRepo>,
        tagger: Arc<dyn ComplianceTagger>,
        idempotency_window: Duration,
        max_handler_attempts: u32,
    ) -> Self {
        Subscriber {
            history_repo,
            audit_repo,
            dlq_repo,
            tagger,
            seen: DashMap::new(),
            idempotency_window,
            max_handler_attempts,
        }
    }

    /// Drain a broker subscription, processing each delivery until the channel closes.
    pub async fn run(&self, broker: &dyn Broker, pattern: &str, durable_name: &str) {
        let mut rx = broker.subscribe(pattern, durable_name);
        while let Some(delivery) = rx.recv().await {
            self.handle_delivery(delivery);
        }
    }

    /// Process one delivery: validate, dedupe, dispatch, ack/nack.
    pub fn handle_delivery(&self, delivery: Delivery) {
        self.prune_seen();
        let envelope = delivery.envelope.clone();

        if self.seen.contains_key(&envelope.id) {
            info!(event_id = %envelope.id, "duplicate event ignored");
            delivery.ack.ack();
            return;
        }

        match self.handle_event(&envelope) {
            Ok(()) => {
                self.seen.insert(envelope.id.clone(), Timestamp::now());
                delivery.ack.ack();
            }
            Err(err) => {
                error!(event_id = %envelope.id, error = %err, "event handler failed");
                self.dlq_repo.append(DlqEntry {
                    source: "processing".into(),
                    original_payload: envelope.to_json(),
                    error: err,
                    first_failed_at: Timestamp::now(),
                    attempts: self.max_handler_attempts,
                });
                delivery.ack.nack();
            }
        }
    }

    /// Validate a raw payload as a CloudEvent; malformed payloads go to the parse-DLQ.
    pub fn handle_raw(&self, raw: &serde_json::Value) {
        match CloudEvent::from_json(raw) {
            Ok(envelope) => self.handle_delivery_without_ack(envelope, raw.clone()),
            Err(err) => {
                warn!(error = %err, "malformed event envelope");
                self.dlq_repo.append(DlqEntry {
                    source: "parse".into(),
                    original_payload: raw.clone(),
                    error: err,
                    first_failed_at: Timestamp::now(),
                    attempts: 1,
                });
            }
        }
    }

    fn handle_delivery_without_ack(&self, envelope: CloudEvent, raw: serde_json::Value) {
        if self.seen.contains_key(&envelope.id) {
            return;
        }
        if let Err(err) = self.handle_event(&envelope) {
            self.dlq_repo.append(DlqEntry {
                source: "processing".into(),
                original_payload: raw,
                error: err,
                first_failed_at: Timestamp::now(),
                attempts: self.max_handler_attempts,
            });
        } else {
            self.seen.insert(envelope.id.clone(), Timestamp::now());
        }
    }

    fn handle_event(&self, envelope: &CloudEvent) -> Result<(), String> {
        match &envelope.data {
            Event::SchemaChanged(data) => {
                let breaking = data.changes.iter().filter(|c| c.breaking_change).count();
                self.history_repo.append(HistoryEntry {
                    commit_hash: data.commit_hash.clone(),
                    branch: data.branch.clone(),
                    timestamp: Timestamp::now(),
                    author: data.author.clone(),
                    author_email: None,
                    message: data.message.clone(),
                    operation: "update".into(),
                    resource_type: data.resource_type.to_string(),
                    resource_id: data.resource_id.to_string(),
                    resource_name: data.resource_name.clone(),
                    changes: data.changes.clone(),
                    total_changes: data.changes.len(),
                    breaking_changes: breaking,
                    metadata: serde_json::json!({ "event_id": envelope.id }),
                });
                self.record_audit(
                    "SCHEMA_CHANGE",
                    &data.branch,
                    data.resource_type,
                    &data.resource_id.to_string(),
                    &data.author,
                    &data.changes,
                    "update",
                    false,
                );
                Ok(())
            }
            Event::SchemaReverted(data) => {
                let flipped: Vec<_> = data
                    .changes
                    .iter()
                    .map(|c| crate::event::ChangeDetail {
                        field: c.field.clone(),
                        operation: c.operation.clone(),
                        old_value: c.new_value.clone(),
                        new_value: c.old_value.clone(),
                        path: c.path.clone(),
                        breaking_change: false,
                    })
                    .collect();
                self.history_repo.append(HistoryEntry {
                    commit_hash: data.reverted_to.clone(),
                    branch: data.branch.clone(),
                    timestamp: Timestamp::now(),
                    author: data.author.clone(),
                    author_email: None,
                    message: format!("revert to {}", data.reverted_to),
                    operation: "revert".into(),
                    resource_type: "schema".into(),
                    resource_id: data.revert_type.clone(),
                    resource_name: None,
                    changes: flipped.clone(),
                    total_changes: flipped.len(),
                    breaking_changes: 0,
                    metadata: serde_json::json!({ "event_id": envelope.id, "reverted_from": data.reverted_from }),
                });
                self.record_audit(
                    "SCHEMA_REVERT",
                    &data.branch,
                    oms_core::ResourceType::ObjectType,
                    &data.revert_type,
                    &data.author,
                    &flipped,
                    "revert",
                    false,
                );
                Ok(())
            }
            Event::MergeCompleted(_)
            | Event::BranchCreated(_)
            | Event::IndexSwitched(_)
            | Event::LockAcquired(_)
            | Event::LockReleased(_)
            | Event::LockAutoReleased(_) => {
                self.record_audit(
                    "SCHEMA_VALIDATION",
                    envelope.data.branch(),
                    oms_core::ResourceType::ObjectType,
                    envelope.event_type.as_str(),
                    "system",
                    &[],
                    "update",
                    false,
                );
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_audit(
        &self,
        mapped_type: &str,
        branch: &BranchName,
        resource_type: oms_core::ResourceType,
        resource_id: &str,
        actor: &str,
        changes: &[crate::event::ChangeDetail],
        operation: &str,
        failed: bool,
    ) {
        let severity = derive_severity(changes, operation, failed);
        let breaking = changes.iter().any(|c| c.breaking_change);
        let tags = self.tagger.compliance_tags(
            &format!("com.oms.{}", mapped_type.to_lowercase()),
            &resource_type,
            resource_id,
        );
        let classification = self.tagger.data_classification(&resource_type, resource_id);
        let siem_severity = severity.siem_score(breaking, operation == "delete", failed);

        let entry = AuditLogEntry {
            event_type: mapped_type.to_string(),
            branch: branch.clone(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            actor: actor.to_string(),
            severity,
            compliance_tags: tags,
            data_classification: classification,
            siem_severity,
            timestamp: Timestamp::now(),
        };
        self.audit_repo.append(entry.clone());
        if siem_severity >= 4 {
            self.audit_repo.send_to_siem(&entry);
        }
    }

    fn prune_seen(&self) {
        let cutoff = Timestamp::now();
        self.seen.retain(|_, seen_at| {
            cutoff
                .duration_since(*seen_at)
                .map(|elapsed| elapsed < self.idempotency_window)
                .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::DefaultComplianceTagger;
    use crate::event::{BranchCreatedData, ChangeDetail, SchemaChangedData, SchemaRevertedData};
    use oms_core::{CommitHash, ResourceId, ResourceType};

    fn subscriber() -> (Subscriber, Arc<InMemorySinks>) {
        let sinks = Arc::new(InMemorySinks::new());
        let sub = Subscriber::new(
            sinks.clone(),
            sinks.clone(),
            sinks.clone(),
            Arc::new(DefaultComplianceTagger),
            Duration::from_secs(3600),
            5,
        );
        (sub, sinks)
    }

    fn schema_changed_envelope(breaking: bool) -> CloudEvent {
        CloudEvent::new(
            "oms/engine",
            Event::SchemaChanged(SchemaChangedData {
                branch: BranchName::new("main").unwrap(),
                commit_hash: CommitHash::compute(b"c1"),
                resource_type: ResourceType::Property,
                resource_id: ResourceId::new("age").unwrap(),
                resource_name: Some("Age".into()),
                author: "alice".into(),
                message: "widen type".into(),
                changes: vec![ChangeDetail {
                    field: "type".into(),
                    operation: "update".into(),
                    old_value: Some(serde_json::json!("integer")),
                    new_value: Some(serde_json::json!("long")),
                    path: "age.type".into(),
                    breaking_change: breaking,
                }],
            }),
        )
    }

    #[test]
    fn schema_changed_produces_history_and_audit() {
        let (sub, sinks) = subscriber();
        sub.handle_raw(&schema_changed_envelope(false).to_json());
        assert_eq!(sinks.history.lock().len(), 1);
        assert_eq!(sinks.audit.lock().len(), 1);
        assert_eq!(sinks.audit.lock()[0].event_type, "SCHEMA_CHANGE");
    }

    #[test]
    fn schema_change_audit_entry_carries_sox_tag() {
        let (sub, sinks) = subscriber();
        sub.handle_raw(&schema_changed_envelope(false).to_json());
        let entry = &sinks.audit.lock()[0];
        assert!(entry.compliance_tags.contains(&"SOX".to_string()));
    }

    #[test]
    fn schema_revert_audit_entry_carries_sox_tag() {
        let (sub, sinks) = subscriber();
        let envelope = CloudEvent::new(
            "oms/engine",
            Event::SchemaReverted(SchemaRevertedData {
                branch: BranchName::new("main").unwrap(),
                reverted_from: CommitHash::compute(b"bad"),
                reverted_to: CommitHash::compute(b"good"),
                revert_type: "single_commit".into(),
                author: "alice".into(),
                changes: vec![],
            }),
        );
        sub.handle_raw(&envelope.to_json());
        let entry = &sinks.audit.lock()[0];
        assert!(entry.compliance_tags.contains(&"SOX".to_string()));
    }

    #[test]
    fn breaking_change_escalates_to_warning_and_siem() {
        let (sub, sinks) = subscriber();
        sub.handle_raw(&schema_changed_envelope(true).to_json());
        assert_eq!(sinks.audit.lock()[0].severity, AuditSeverity::Warning);
        assert_eq!(sinks.siem.lock().len(), 1);
    }

    #[test]
    fn revert_never_counts_as_breaking() {
        let (sub, sinks) = subscriber();
        let envelope = CloudEvent::new(
            "oms/engine",
            Event::SchemaReverted(SchemaRevertedData {
                branch: BranchName::new("main").unwrap(),
                reverted_from: CommitHash::compute(b"bad"),
                reverted_to: CommitHash::compute(b"good"),
                revert_type: "single_commit".into(),
                author: "alice".into(),
                changes: vec![ChangeDetail {
                    field: "type".into(),
                    operation: "update".into(),
                    old_value: Some(serde_json::json!("long")),
                    new_value: Some(serde_json::json!("integer")),
                    path: "age.type".into(),
                    breaking_change: true,
                }],
            }),
        );
        sub.handle_raw(&envelope.to_json());
        assert_eq!(sinks.history.lock()[0].breaking_changes, 0);
    }

    #[test]
    fn duplicate_event_id_is_not_reprocessed() {
        let (sub, sinks) = subscriber();
        let envelope = schema_changed_envelope(false);
        sub.handle_raw(&envelope.to_json());
        sub.handle_raw(&envelope.to_json());
        assert_eq!(sinks.history.lock().len(), 1);
    }

    #[test]
    fn malformed_envelope_goes_to_parse_dlq() {
        let (sub, sinks) = subscriber();
        sub.handle_raw(&serde_json::json!({"not": "an envelope"}));
        assert_eq!(sinks.dlq.lock().len(), 1);
        assert_eq!(sinks.dlq.lock()[0].source, "parse");
    }

    #[test]
    fn unknown_handler_category_still_produces_audit_trail() {
        let (sub, sinks) = subscriber();
        let envelope = CloudEvent::new(
            "oms/engine",
            Event::BranchCreated(BranchCreatedData {
                branch: BranchName::new("feature-x").unwrap(),
                parent: Some(BranchName::new("main").unwrap()),
                commit_hash: CommitHash::compute(b"root"),
                author: "alice".into(),
            }),
        );
        sub.handle_raw(&envelope.to_json());
        assert_eq!(sinks.audit.lock()[0].event_type, "SCHEMA_VALIDATION");
    }
}
