//! Shared types, error taxonomy, and configuration for the ontology
//! management workspace.
//!
//! Every other crate in the workspace (`oms-storage`, `oms-locks`,
//! `oms-outbox`, `oms-engine`, `oms-api`) depends on this one and none
//! of its siblings; it carries no persistence or concurrency logic of
//! its own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entity_ref;
pub mod error;
pub mod types;

pub use config::Config;
pub use entity_ref::EntityRef;
pub use error::{Error, ErrorKind, Result};
pub use types::{
    BranchName, Cardinality, ChangeType, CommitHash, ContentHash, ETag, PropertyType, ResourceId,
    ResourceType, Timestamp, Version,
};
