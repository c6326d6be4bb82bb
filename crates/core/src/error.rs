//! Unified error taxonomy
//!
//! Every fallible operation in the workspace returns [`Error`]. Each
//! variant maps to exactly one [`ErrorKind`] so callers can branch on
//! category (retry, surface to a client as 404/409/etc., page an
//! operator) without matching on every concrete variant.

use crate::types::{BranchName, ResourceId, ResourceType};
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The seven error categories a caller needs to distinguish.
///
/// Mirrors the category grouping a storage engine's own error enum
/// tends to expose (not-found vs. conflict vs. validation vs.
/// permission vs. timeout vs. unavailable vs. fatal) so every crate in
/// the workspace reports through the same lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The requested entity does not exist.
    NotFound,
    /// The request conflicts with concurrent state (stale head, stale etag, lock held).
    Conflict,
    /// The request is structurally or semantically invalid.
    Validation,
    /// The caller lacks the authority to perform the operation.
    Permission,
    /// The operation exceeded its allotted time budget.
    Timeout,
    /// A dependency is temporarily unavailable; retrying later may succeed.
    Unavailable,
    /// An invariant was violated; not safe to retry without investigation.
    Fatal,
}

/// The unified error type returned by every fallible operation in the workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// A commit names parent hashes that do not share a common lineage.
    #[error("commit parents {0:?} do not share a common lineage")]
    ConflictingParent(Vec<String>),

    /// A commit's tree failed structural validation.
    #[error("invalid tree: {reason}")]
    InvalidTree {
        /// Why the tree was rejected.
        reason: String,
    },

    /// The requested entity does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// Human-readable entity kind, e.g. "branch", "commit", "resource".
        what: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A branch advance was attempted against a stale expected head.
    #[error("branch {branch} head is stale: expected {expected}, found {actual}")]
    StaleHead {
        /// The branch being advanced.
        branch: BranchName,
        /// The head the caller believed was current.
        expected: String,
        /// The head actually stored.
        actual: String,
    },

    /// A conditional request's `If-Match` etag no longer matches stored state.
    #[error("etag {supplied} is stale for {resource_type}/{resource_id}")]
    StaleEtag {
        /// The resource type addressed.
        resource_type: ResourceType,
        /// The resource id addressed.
        resource_id: ResourceId,
        /// The etag the caller supplied.
        supplied: String,
    },

    /// A lock request conflicts with an existing, incompatible lock.
    #[error("lock conflict on branch {branch}: {reason}")]
    LockConflict {
        /// The branch the lock was requested against.
        branch: BranchName,
        /// Why the requested scope conflicts with the held lock.
        reason: String,
    },

    /// A release/heartbeat was attempted by a holder that does not own the lock.
    #[error("holder {holder} does not own lock {lock_id}")]
    NotOwner {
        /// The lock in question.
        lock_id: String,
        /// The holder that attempted the operation.
        holder: String,
    },

    /// A shadow build was requested for a `(branch, index_type)` pair already building.
    #[error("shadow build already in progress for branch {branch}, index {index_type}")]
    DuplicateBuild {
        /// The branch the build targets.
        branch: BranchName,
        /// The index type already building.
        index_type: String,
    },

    /// A request failed structural or semantic validation.
    #[error("validation failed: {message}")]
    Validation {
        /// What about the request was invalid.
        message: String,
    },

    /// A lock could not be acquired before its deadline.
    #[error("timed out waiting for lock on branch {branch}")]
    LockTimeout {
        /// The branch the lock was requested against.
        branch: BranchName,
    },

    /// A branch name collides with one that already exists.
    #[error("branch name already taken: {0}")]
    NameTaken(BranchName),

    /// A commit hash was referenced that is not present in the store.
    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    /// A write was rejected because the branch is locked against writes.
    #[error("branch {branch} is write-locked: {reason}")]
    WriteLocked {
        /// The branch that rejected the write.
        branch: BranchName,
        /// Why the branch is locked.
        reason: String,
    },

    /// The underlying persistent store is unreachable or erroring.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// An operation exceeded its wall-clock budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An unrecoverable internal invariant was violated.
    #[error("fatal: {message}")]
    Fatal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl Error {
    /// Classify this error into one of the seven top-level kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } | Error::UnknownCommit(_) => ErrorKind::NotFound,
            Error::ConflictingParent(_)
            | Error::StaleHead { .. }
            | Error::StaleEtag { .. }
            | Error::LockConflict { .. }
            | Error::DuplicateBuild { .. }
            | Error::NameTaken(_)
            | Error::WriteLocked { .. } => ErrorKind::Conflict,
            Error::InvalidTree { .. } | Error::Validation { .. } => ErrorKind::Validation,
            Error::NotOwner { .. } => ErrorKind::Permission,
            Error::LockTimeout { .. } | Error::Timeout(_) => ErrorKind::Timeout,
            Error::StorageUnavailable(_) => ErrorKind::Unavailable,
            Error::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether a caller may reasonably retry this operation unchanged.
    ///
    /// Only transient, environment-caused failures are retryable. A
    /// conflict needs the caller to re-read state and retry with fresh
    /// inputs (not a bare retry), so conflicts are deliberately excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_partitions_every_variant() {
        let examples: Vec<Error> = vec![
            Error::NotFound { what: "branch", id: "main".into() },
            Error::UnknownCommit("deadbeef".into()),
            Error::ConflictingParent(vec!["a".into()]),
            Error::NameTaken(BranchName::new("main").unwrap()),
            Error::InvalidTree { reason: "bad".into() },
            Error::Validation { message: "bad".into() },
            Error::NotOwner { lock_id: "l1".into(), holder: "h1".into() },
            Error::LockTimeout { branch: BranchName::new("main").unwrap() },
            Error::StorageUnavailable("down".into()),
            Error::Fatal { message: "oops".into() },
        ];
        for e in examples {
            let _ = e.kind();
        }
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::StorageUnavailable("x".into()).is_retryable());
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(!Error::Validation { message: "x".into() }.is_retryable());
        assert!(!Error::NameTaken(BranchName::new("main").unwrap()).is_retryable());
    }
}
