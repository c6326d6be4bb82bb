//! The commit store: append-only commit DAG plus per-resource version chains

use crate::commit::{Commit, ResourceVersion};
use crate::tree::SchemaTree;
use dashmap::DashMap;
use oms_core::{BranchName, CommitHash, EntityRef, Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// A not-yet-published event, staged in the same write as the commit
/// that produced it so the two either both land or neither does.
///
/// `oms-outbox`'s publisher drains these through [`CommitStore::drain_outbox_rows`]
/// rather than `oms-storage` depending on `oms-outbox` directly.
#[derive(Debug, Clone)]
pub struct OutboxDraft {
    /// CloudEvents `type`, e.g. `"com.oms.schema.changed"`.
    pub event_type: String,
    /// Event-specific payload, encoded by the caller.
    pub payload: serde_json::Value,
}

/// Everything persisted for one branch's history.
struct BranchShard {
    /// Commit hash -> (commit, tree at that commit).
    commits: std::collections::HashMap<CommitHash, (Commit, SchemaTree)>,
    /// Current head, if any commits have landed.
    head: Option<CommitHash>,
    /// Per-resource version chains, newest-first, for O(1) "latest" reads.
    versions: std::collections::HashMap<EntityRef, VecDeque<ResourceVersion>>,
    /// Events staged by commits not yet drained by the publisher.
    pending_outbox: VecDeque<OutboxDraft>,
}

impl BranchShard {
    fn new() -> Self {
        BranchShard {
            commits: std::collections::HashMap::new(),
            head: None,
            versions: std::collections::HashMap::new(),
            pending_outbox: VecDeque::new(),
        }
    }
}

/// Append-only commit store and per-resource version chain.
pub trait CommitStore: Send + Sync {
    /// Append a commit to `branch`, staging `versions` and `outbox_rows`
    /// in the same critical section. Rejects a commit whose parents
    /// aren't already known (`ConflictingParent`) except for the first
    /// commit on a branch, which has no parents.
    fn append_commit(
        &self,
        branch: &BranchName,
        commit: Commit,
        tree: SchemaTree,
        versions: Vec<ResourceVersion>,
        outbox_rows: Vec<OutboxDraft>,
    ) -> Result<()>;

    /// Fetch a commit by hash.
    fn get_commit(&self, hash: &CommitHash) -> Result<Commit>;

    /// Materialize the schema tree as of `hash`.
    fn get_tree(&self, hash: &CommitHash) -> Result<SchemaTree>;

    /// The latest version row for `key` on `branch`, if the resource has any history.
    fn get_resource_version(
        &self,
        branch: &BranchName,
        key: &EntityRef,
    ) -> Result<Option<ResourceVersion>>;

    /// Record a version directly (used when tracking a change without a full commit,
    /// mirroring `version_service.py`'s `track_change`).
    fn track_change(&self, branch: &BranchName, version: ResourceVersion) -> Result<()>;

    /// Current head commit of `branch`, if it has any history.
    fn branch_head(&self, branch: &BranchName) -> Option<CommitHash>;

    /// Lowest common ancestor of two commits, walking parent pointers.
    /// Ties are broken by sorted hash comparison for determinism.
    fn common_ancestor(&self, a: &CommitHash, b: &CommitHash) -> Result<CommitHash>;

    /// Drain (and clear) the events staged for `branch`, for the publisher to pick up.
    fn drain_outbox_rows(&self, branch: &BranchName) -> Vec<OutboxDraft>;
}

/// `DashMap`-backed in-memory commit store, sharded per branch so commits
/// on different branches never contend.
pub struct InMemoryCommitStore {
    shards: DashMap<BranchName, Arc<Mutex<BranchShard>>>,
}

impl InMemoryCommitStore {
    /// An empty store.
    pub fn new() -> Self {
        InMemoryCommitStore {
            shards: DashMap::new(),
        }
    }

    fn shard(&self, branch: &BranchName) -> Arc<Mutex<BranchShard>> {
        self.shards
            .entry(branch.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BranchShard::new())))
            .clone()
    }

    /// Find the branch owning a commit (linear scan; commit hashes are
    /// globally unique content addresses, so this is only used for
    /// cross-branch ancestor walks, not hot-path reads).
    fn locate(&self, hash: &CommitHash) -> Option<(Commit, SchemaTree)> {
        for entry in self.shards.iter() {
            let shard = entry.value().lock();
            if let Some(found) = shard.commits.get(hash) {
                return Some(found.clone());
            }
        }
        None
    }
}

impl Default for InMemoryCommitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitStore for InMemoryCommitStore {
    fn append_commit(
        &self,
        branch: &BranchName,
        commit: Commit,
        tree: SchemaTree,
        versions: Vec<ResourceVersion>,
        outbox_rows: Vec<OutboxDraft>,
    ) -> Result<()> {
        let shard = self.shard(branch);
        let mut shard = shard.lock();

        if !commit.parents.is_empty() {
            for parent in &commit.parents {
                if !shard.commits.contains_key(parent) && self.locate(parent).is_none() {
                    return Err(Error::ConflictingParent(vec![parent.to_string()]));
                }
            }
        }

        shard.head = Some(commit.hash.clone());
        shard.commits.insert(commit.hash.clone(), (commit, tree));
        for version in versions {
            let chain = shard.versions.entry(EntityRef::new(
                version.resource_type,
                version.resource_id.clone(),
                version.branch.clone(),
            )).or_insert_with(VecDeque::new);
            chain.push_front(version);
        }
        shard.pending_outbox.extend(outbox_rows);
        Ok(())
    }

    fn get_commit(&self, hash: &CommitHash) -> Result<Commit> {
        self.locate(hash)
            .map(|(commit, _)| commit)
            .ok_or_else(|| Error::UnknownCommit(hash.to_string()))
    }

    fn get_tree(&self, hash: &CommitHash) -> Result<SchemaTree> {
        self.locate(hash)
            .map(|(_, tree)| tree)
            .ok_or_else(|| Error::UnknownCommit(hash.to_string()))
    }

    fn get_resource_version(
        &self,
        branch: &BranchName,
        key: &EntityRef,
    ) -> Result<Option<ResourceVersion>> {
        let shard = self.shard(branch);
        let shard = shard.lock();
        Ok(shard.versions.get(key).and_then(|chain| chain.front().cloned()))
    }

    fn track_change(&self, branch: &BranchName, version: ResourceVersion) -> Result<()> {
        let shard = self.shard(branch);
        let mut shard = shard.lock();
        let key = EntityRef::new(version.resource_type, version.resource_id.clone(), version.branch.clone());
        shard.versions.entry(key).or_insert_with(VecDeque::new).push_front(version);
        Ok(())
    }

    fn branch_head(&self, branch: &BranchName) -> Option<CommitHash> {
        self.shards.get(branch).and_then(|shard| shard.lock().head.clone())
    }

    fn common_ancestor(&self, a: &CommitHash, b: &CommitHash) -> Result<CommitHash> {
        let ancestors_of = |start: &CommitHash| -> Result<Vec<CommitHash>> {
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(start.clone());
            while let Some(hash) = queue.pop_front() {
                if !seen.insert(hash.clone()) {
                    continue;
                }
                order.push(hash.clone());
                let commit = self.get_commit(&hash)?;
                for parent in commit.parents {
                    queue.push_back(parent);
                }
            }
            Ok(order)
        };

        let ancestors_a: HashSet<CommitHash> = ancestors_of(a)?.into_iter().collect();
        let mut candidates: Vec<CommitHash> = ancestors_of(b)?
            .into_iter()
            .filter(|h| ancestors_a.contains(h))
            .collect();

        candidates.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Fatal {
                message: format!("no common ancestor between {a} and {b}"),
            })
    }

    fn drain_outbox_rows(&self, branch: &BranchName) -> Vec<OutboxDraft> {
        let shard = self.shard(branch);
        let mut shard = shard.lock();
        shard.pending_outbox.drain(..).collect()
    }
}
