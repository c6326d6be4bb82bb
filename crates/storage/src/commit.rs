//! Commits and per-resource version chains

use oms_core::{BranchName, ChangeType, CommitHash, ContentHash, ETag, ResourceId, ResourceType, Timestamp, Version};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A single point in the commit DAG.
///
/// `hash = sha2("{parents}|{author}|{time}|{tree_hash}")`, computed by
/// [`Commit::compute_hash`] and checked by every store implementation
/// before a commit is accepted — two commits with identical parents,
/// author, time and tree hash necessarily collide, which is treated as
/// the same commit rather than an error (idempotent append).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// This commit's content hash.
    pub hash: CommitHash,
    /// Parent commits. Zero parents for the first commit on a branch,
    /// two for a merge commit, one otherwise.
    pub parents: SmallVec<[CommitHash; 2]>,
    /// Who authored the commit.
    pub author: String,
    /// When the commit was created.
    pub time: Timestamp,
    /// Free-form commit message.
    pub message: String,
    /// Hash of the [`crate::tree::SchemaTree`] this commit snapshots.
    pub tree_hash: ContentHash,
}

impl Commit {
    /// Construct a commit and compute its hash from its own fields.
    pub fn new(
        parents: SmallVec<[CommitHash; 2]>,
        author: impl Into<String>,
        time: Timestamp,
        message: impl Into<String>,
        tree_hash: ContentHash,
    ) -> Self {
        let author = author.into();
        let message = message.into();
        let hash = Self::compute_hash(&parents, &author, time, &tree_hash);
        Commit {
            hash,
            parents,
            author,
            time,
            message,
            tree_hash,
        }
    }

    /// `H(parents ∥ author ∥ time ∥ tree-root)`.
    pub fn compute_hash(
        parents: &[CommitHash],
        author: &str,
        time: Timestamp,
        tree_hash: &ContentHash,
    ) -> CommitHash {
        let mut input = String::new();
        for p in parents {
            input.push_str(p.as_str());
            input.push('|');
        }
        input.push_str(author);
        input.push('|');
        input.push_str(&time.to_rfc3339());
        input.push('|');
        input.push_str(tree_hash.as_str());
        CommitHash::compute(input.as_bytes())
    }

    /// Whether this is a merge commit (two or more parents).
    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

/// One version of one resource in its per-resource version chain.
///
/// Chains are monotonic: `version` strictly increases by 1 with each
/// append, and `parent_version` always names the immediately preceding
/// version (or `None` for the first version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    /// The resource's type.
    pub resource_type: ResourceType,
    /// The resource's id.
    pub resource_id: ResourceId,
    /// The branch this version lives on.
    pub branch: BranchName,
    /// 1-based position in the chain.
    pub version: Version,
    /// The commit that produced this version.
    pub commit_hash: CommitHash,
    /// The version that preceded this one, if any.
    pub parent_version: Option<Version>,
    /// Cache validator for this exact `(resource, version)`.
    pub etag: ETag,
    /// Hash of this version's content.
    pub content_hash: ContentHash,
    /// Size in bytes of the canonical content, for quota/metrics purposes.
    pub size: usize,
    /// Whether this version created, updated, or deleted the resource.
    pub change_type: ChangeType,
    /// Human-readable summary of the change.
    pub summary: String,
    /// Dotted field paths that changed relative to `parent_version`.
    pub fields_changed: Vec<String>,
    /// Who made the change.
    pub author: String,
    /// When the change was made.
    pub time: Timestamp,
}
