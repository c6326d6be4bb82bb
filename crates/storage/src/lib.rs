//! The commit store (append-only commit DAG, per-resource version
//! chains) and the ETag/delta service that encodes the difference
//! between two resource versions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod delta;
pub mod store;
pub mod tree;

pub use commit::{Commit, ResourceVersion};
pub use delta::{CacheValidation, Delta, DeltaEngine, DeltaPayload, DeltaPreferences, DeltaType};
pub use store::{CommitStore, InMemoryCommitStore, OutboxDraft};
pub use tree::SchemaTree;
