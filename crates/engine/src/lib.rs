//! Branch registry, merge engine, shadow index coordinator, and the
//! `Ontology` façade wiring `oms-storage`, `oms-locks`, and `oms-outbox`
//! behind a single write-admission-checked API.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod database;
pub mod merge;
pub mod shadow;

pub use branch::{Branch, BranchRegistry, BranchState, ProtectionFlags};
pub use database::{InMemoryOutboxRepo, Ontology, OntologyBuilder, WriteRequest};
pub use merge::{
    cardinality_severity, detect_circular_dependencies, property_type_severity, ConflictKind,
    ConflictSeverity, MergeConflict, MergeEngine, MergeResult, MergeStats, MergeStatus,
    MigrationImpact, RequiredEdge, Resolution,
};
pub use shadow::{ShadowIndex, ShadowIndexCoordinator, ShadowState, SwitchRequest, SwitchResult};
