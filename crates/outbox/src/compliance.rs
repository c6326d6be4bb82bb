//! Compliance tagging and data classification for audit log entries
//!
//! Behind a trait rather than fixed logic: the heuristic below is a
//! reasonable default, not an invariant the rest of the system depends
//! on, so a deployment with its own regulatory mapping can substitute
//! one without touching the subscriber.

use oms_core::ResourceType;

/// Derives compliance tags and a data classification for an event,
/// given its CloudEvents `type` and the resource it concerns.
pub trait ComplianceTagger: Send + Sync {
    /// Compliance regimes this event is relevant to, e.g. `"GDPR"`, `"SOX"`, `"PCI-DSS"`.
    fn compliance_tags(&self, event_type: &str, resource_type: &ResourceType, resource_id: &str) -> Vec<String>;

    /// Data sensitivity classification: `"public"`, `"internal"`, `"confidential"`, or `"restricted"`.
    fn data_classification(&self, resource_type: &ResourceType, resource_id: &str) -> String;
}

/// Default tagger, matching the heuristic an audit pipeline commonly
/// hard-codes for schema-change auditing: SOX for every schema
/// change/revert, GDPR for anything touching user-shaped resources, and
/// PCI-DSS for anything touching payment-shaped resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultComplianceTagger;

impl ComplianceTagger for DefaultComplianceTagger {
    fn compliance_tags(&self, event_type: &str, resource_type: &ResourceType, resource_id: &str) -> Vec<String> {
        let mut tags = Vec::new();
        if event_type == "com.oms.schema_change" || event_type == "com.oms.schema_revert" {
            tags.push("SOX".to_string());
        }
        let id_lower = resource_id.to_lowercase();
        if resource_type.as_str().to_lowercase().contains("user") || id_lower.contains("user") {
            tags.push("GDPR".to_string());
        }
        if ["payment", "card", "transaction"].iter().any(|kw| id_lower.contains(kw)) {
            tags.push("PCI-DSS".to_string());
        }
        tags
    }

    fn data_classification(&self, resource_type: &ResourceType, resource_id: &str) -> String {
        let type_lower = resource_type.as_str().to_lowercase();
        let id_lower = resource_id.to_lowercase();
        if type_lower.contains("user") || id_lower.contains("user") {
            "confidential".to_string()
        } else if ["payment", "card", "financial"].iter().any(|kw| id_lower.contains(kw)) {
            "restricted".to_string()
        } else if type_lower == "schema" || type_lower == "system" {
            "internal".to_string()
        } else {
            "internal".to_string()
        }
    }
}

/// Severity of an audit log entry, derived by [`derive_severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuditSeverity {
    /// Routine, successful change.
    Info,
    /// Noteworthy but not erroneous: a breaking change or a delete.
    Warning,
    /// The underlying operation failed.
    Error,
}

impl AuditSeverity {
    /// SIEM-facing numeric severity, matching the scale an audit
    /// pipeline typically forwards to a SIEM: failures rank highest,
    /// breaking changes next, deletes next, everything else lowest.
    pub fn siem_score(&self, breaking_change: bool, is_delete: bool, failed: bool) -> u8 {
        if failed {
            7
        } else if breaking_change {
            5
        } else if is_delete {
            4
        } else {
            let _ = self;
            2
        }
    }
}

/// Derive an audit entry's severity: any breaking change or a delete
/// operation warrants `Warning`; a failed result is always `Error`;
/// everything else is `Info`.
pub fn derive_severity(changes: &[crate::event::ChangeDetail], operation: &str, failed: bool) -> AuditSeverity {
    if failed {
        return AuditSeverity::Error;
    }
    if changes.iter().any(|c| c.breaking_change) || operation == "delete" {
        return AuditSeverity::Warning;
    }
    AuditSeverity::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_events_always_get_sox() {
        let tagger = DefaultComplianceTagger;
        let tags = tagger.compliance_tags("com.oms.schema_change", &ResourceType::Property, "age");
        assert!(tags.contains(&"SOX".to_string()));
        let tags = tagger.compliance_tags("com.oms.schema_revert", &ResourceType::Property, "age");
        assert!(tags.contains(&"SOX".to_string()));
    }

    #[test]
    fn user_resources_get_gdpr_and_confidential() {
        let tagger = DefaultComplianceTagger;
        let tags = tagger.compliance_tags("com.oms.schema_change", &ResourceType::ObjectType, "user_profile");
        assert!(tags.contains(&"GDPR".to_string()));
        let classification = tagger.data_classification(&ResourceType::ObjectType, "user_profile");
        assert_eq!(classification, "confidential");
    }

    #[test]
    fn payment_ids_get_pci_and_restricted() {
        let tagger = DefaultComplianceTagger;
        let tags = tagger.compliance_tags("com.oms.schema_change", &ResourceType::Property, "payment_amount");
        assert!(tags.contains(&"PCI-DSS".to_string()));
        let classification = tagger.data_classification(&ResourceType::Property, "card_number");
        assert_eq!(classification, "restricted");
    }

    #[test]
    fn severity_prioritizes_failure_over_breaking_change() {
        let changes = vec![crate::event::ChangeDetail {
            field: "type".into(),
            operation: "update".into(),
            old_value: None,
            new_value: None,
            path: "type".into(),
            breaking_change: true,
        }];
        assert_eq!(derive_severity(&changes, "update", true), AuditSeverity::Error);
        assert_eq!(derive_severity(&changes, "update", false), AuditSeverity::Warning);
        assert_eq!(derive_severity(&[], "delete", false), AuditSeverity::Warning);
        assert_eq!(derive_severity(&[], "update", false), AuditSeverity::Info);
    }
}
