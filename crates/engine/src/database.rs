//! `Ontology`: the root façade wiring the commit store, branch registry,
//! lock manager, delta engine, merge engine, shadow index coordinator
//! and outbox behind a single write-admission-checked API.

use crate::branch::{Branch, BranchRegistry, BranchState};
use crate::merge::{MergeEngine, MergeResult, MergeStatus};
use crate::shadow::ShadowIndexCoordinator;
use dashmap::DashMap;
use oms_core::{BranchName, Config, Error, Result, Timestamp};
use oms_locks::{LockManager, LockScope};
use oms_outbox::{OutboxRepo, OutboxRow, OutboxStatus};
use oms_storage::{Commit, CommitStore, DeltaEngine, DeltaPreferences, OutboxDraft, ResourceVersion, SchemaTree};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// In-memory [`OutboxRepo`] staging rows drained from a [`CommitStore`].
/// Kept in `oms-engine` rather than `oms-outbox` since it's the glue
/// between two crates that otherwise don't know about each other.
pub struct InMemoryOutboxRepo {
    rows: DashMap<Uuid, OutboxRow>,
}

impl InMemoryOutboxRepo {
    /// An empty repo.
    pub fn new() -> Self {
        InMemoryOutboxRepo { rows: DashMap::new() }
    }

    /// Stage a batch of drained drafts as pending rows.
    pub fn stage(&self, branch: &BranchName, commit_hash: Option<oms_core::CommitHash>, drafts: Vec<OutboxDraft>) {
        for draft in drafts {
            let row = OutboxRow::new(branch.clone(), commit_hash.clone(), draft.event_type, draft.payload);
            self.rows.insert(row.id, row);
        }
    }
}

impl Default for InMemoryOutboxRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxRepo for InMemoryOutboxRepo {
    fn pending(&self, branch: &BranchName, limit: usize) -> Vec<OutboxRow> {
        let mut rows: Vec<OutboxRow> = self
            .rows
            .iter()
            .filter(|e| &e.value().branch == branch && e.value().status == OutboxStatus::Pending)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit);
        rows
    }

    fn branches_with_pending(&self) -> Vec<BranchName> {
        let mut branches: Vec<BranchName> = self
            .rows
            .iter()
            .filter(|e| e.value().status == OutboxStatus::Pending)
            .map(|e| e.value().branch.clone())
            .collect();
        branches.sort();
        branches.dedup();
        branches
    }

    fn update(&self, row: OutboxRow) {
        self.rows.insert(row.id, row);
    }
}

/// A proposed write: the tree after the change plus the version rows
/// and outbox drafts it produces. Built by the caller (the API layer),
/// since only it knows what changed and why.
pub struct WriteRequest {
    /// The branch being written to.
    pub branch: BranchName,
    /// The lock scope this write touches, consulted against the lock manager.
    pub scope: LockScope,
    /// Full tree after the write lands.
    pub tree: SchemaTree,
    /// Per-resource version rows produced by the write.
    pub versions: Vec<ResourceVersion>,
    /// Events to stage in the outbox alongside the commit.
    pub outbox: Vec<OutboxDraft>,
    /// Who made the change.
    pub author: String,
    /// Commit message.
    pub message: String,
}

/// The versioned, branchable ontology store.
pub struct Ontology {
    commits: Arc<dyn CommitStore>,
    branches: Arc<BranchRegistry>,
    locks: Arc<LockManager>,
    delta: DeltaEngine,
    merge: MergeEngine,
    shadow: Arc<ShadowIndexCoordinator>,
    outbox: Arc<InMemoryOutboxRepo>,
    config: Config,
}

impl Ontology {
    /// Commit store backing this ontology.
    pub fn commits(&self) -> &Arc<dyn CommitStore> {
        &self.commits
    }

    /// Branch registry backing this ontology.
    pub fn branches(&self) -> &Arc<BranchRegistry> {
        &self.branches
    }

    /// Lock manager backing this ontology.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Delta engine backing this ontology.
    pub fn delta(&self) -> &DeltaEngine {
        &self.delta
    }

    /// Shadow index coordinator backing this ontology.
    pub fn shadow(&self) -> &Arc<ShadowIndexCoordinator> {
        &self.shadow
    }

    /// Outbox repo backing this ontology, for wiring a [`oms_outbox::Publisher`].
    pub fn outbox(&self) -> &Arc<InMemoryOutboxRepo> {
        &self.outbox
    }

    /// Configuration this ontology was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a new branch. If `parent` is set, the new branch starts
    /// pointing at the parent's current head (a "fork"); otherwise it
    /// starts empty and becomes `Active` on its first commit.
    pub fn create_branch(&self, name: BranchName, parent: Option<BranchName>) -> Result<()> {
        if let Some(parent_name) = &parent {
            let parent_head = self.commits.branch_head(parent_name);
            self.branches.create(Branch::new(name.clone(), Some(parent_name.clone())))?;
            if let Some(head) = parent_head {
                self.branches.advance(&name, None, head)?;
            }
            Ok(())
        } else {
            self.branches.create(Branch::new(name, None))
        }
    }

    /// Land a write: checks the write-admission lock, appends the
    /// commit, advances the branch pointer, and stages its outbox events.
    pub fn commit(&self, req: WriteRequest) -> Result<oms_core::CommitHash> {
        self.locks.check_write_permission(&req.branch, &req.scope)?;

        let branch = self.branches.get(&req.branch)?;
        if branch.state == BranchState::LockedForWrite {
            return Err(Error::WriteLocked {
                branch: req.branch.clone(),
                reason: "branch is locked for write".into(),
            });
        }

        let tree_hash = req.tree.root_hash();
        let parents: smallvec::SmallVec<[oms_core::CommitHash; 2]> = branch.head.clone().into_iter().collect();
        let commit = Commit::new(parents, req.author.as_str(), Timestamp::now(), req.message.as_str(), tree_hash);
        let commit_hash = commit.hash.clone();

        self.commits.append_commit(&req.branch, commit, req.tree, req.versions, req.outbox)?;
        self.branches.advance(&req.branch, branch.head.as_ref(), commit_hash.clone())?;

        let drained = self.commits.drain_outbox_rows(&req.branch);
        self.outbox.stage(&req.branch, Some(commit_hash.clone()), drained);

        Ok(commit_hash)
    }

    /// Merge `source` into `target`, synchronizing the branch registry's
    /// head with whatever the merge engine landed (fast-forward or a new
    /// merge commit) once the merge succeeds non-dry-run.
    pub fn merge(
        &self,
        source: &BranchName,
        target: &BranchName,
        author: &str,
        auto_resolve: bool,
        dry_run: bool,
        deadline: Duration,
    ) -> Result<MergeResult> {
        let target_before = self.branches.get(target)?;
        self.branches.transition_state(target, BranchState::Merging)?;

        let outcome = self.merge.merge_branches(source, target, author, auto_resolve, dry_run, deadline);

        // Always try to return to Active even if the merge itself failed,
        // so a failed merge doesn't leave the branch stuck mid-transition.
        let _ = self.branches.transition_state(target, BranchState::Active);

        let result = outcome?;
        if !dry_run && result.status == MergeStatus::Success {
            if let Some(new_head) = &result.merge_commit {
                self.branches.advance(target, target_before.head.as_ref(), new_head.clone())?;
            }
        }
        Ok(result)
    }

    /// Materialize the current tree on a branch.
    pub fn read_tree(&self, branch: &BranchName) -> Result<SchemaTree> {
        let b = self.branches.get(branch)?;
        match b.head {
            Some(head) => self.commits.get_tree(&head),
            None => Ok(SchemaTree::new()),
        }
    }
}

/// Builds an [`Ontology`] from a [`Config`], wiring the in-memory
/// default backends for every subsystem.
pub struct OntologyBuilder {
    config: Config,
    commits: Option<Arc<dyn CommitStore>>,
}

impl OntologyBuilder {
    /// Start from a config, with default in-memory backends.
    pub fn new(config: Config) -> Self {
        OntologyBuilder { config, commits: None }
    }

    /// Swap in a custom commit store (e.g. a persistent one) instead of
    /// the in-memory default.
    pub fn with_commit_store(mut self, store: Arc<dyn CommitStore>) -> Self {
        self.commits = Some(store);
        self
    }

    /// Build the wired-up ontology.
    pub fn build(self) -> Ontology {
        let commits: Arc<dyn CommitStore> = self
            .commits
            .unwrap_or_else(|| Arc::new(oms_storage::InMemoryCommitStore::new()));
        let locks = Arc::new(LockManager::new());
        let delta = DeltaEngine::new(DeltaPreferences {
            compression_threshold: self.config.delta.compression_threshold,
            compression_improvement_threshold: self.config.delta.compression_improvement_threshold,
            max_chain_length: self.config.delta.max_chain_length,
        });

        Ontology {
            branches: Arc::new(BranchRegistry::new()),
            merge: MergeEngine::new(commits.clone()),
            shadow: Arc::new(ShadowIndexCoordinator::new(locks.clone())),
            outbox: Arc::new(InMemoryOutboxRepo::new()),
            commits,
            locks,
            delta,
            config: self.config,
        }
    }
}

impl Default for OntologyBuilder {
    fn default() -> Self {
        OntologyBuilder::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_core::{EntityRef, ResourceId, ResourceType};

    fn name(s: &str) -> BranchName {
        BranchName::new(s).unwrap()
    }

    fn entity(id: &str) -> EntityRef {
        EntityRef::new(ResourceType::Property, ResourceId::new(id).unwrap(), name("main"))
    }

    #[test]
    fn creating_root_branch_and_committing_advances_its_head() {
        let ontology = OntologyBuilder::default().build();
        ontology.create_branch(name("main"), None).unwrap();

        let mut tree = SchemaTree::new();
        tree.set(entity("age"), serde_json::json!({"type": "integer"}));

        let hash = ontology
            .commit(WriteRequest {
                branch: name("main"),
                scope: LockScope::Branch,
                tree: tree.clone(),
                versions: vec![],
                outbox: vec![],
                author: "alice".into(),
                message: "add age".into(),
            })
            .unwrap();

        assert_eq!(ontology.branches().get(&name("main")).unwrap().head, Some(hash));
        assert_eq!(ontology.read_tree(&name("main")).unwrap(), tree);
    }

    #[test]
    fn write_is_rejected_while_branch_is_locked_for_write() {
        let ontology = OntologyBuilder::default().build();
        ontology.create_branch(name("main"), None).unwrap();
        ontology
            .commit(WriteRequest {
                branch: name("main"),
                scope: LockScope::Branch,
                tree: SchemaTree::new(),
                versions: vec![],
                outbox: vec![],
                author: "alice".into(),
                message: "init".into(),
            })
            .unwrap();
        ontology.branches().transition_state(&name("main"), BranchState::LockedForWrite).unwrap();

        let result = ontology.commit(WriteRequest {
            branch: name("main"),
            scope: LockScope::Branch,
            tree: SchemaTree::new(),
            versions: vec![],
            outbox: vec![],
            author: "alice".into(),
            message: "should fail".into(),
        });
        assert!(matches!(result, Err(Error::WriteLocked { .. })));
    }

    #[test]
    fn forked_branch_starts_at_parent_head() {
        let ontology = OntologyBuilder::default().build();
        ontology.create_branch(name("main"), None).unwrap();
        let hash = ontology
            .commit(WriteRequest {
                branch: name("main"),
                scope: LockScope::Branch,
                tree: SchemaTree::new(),
                versions: vec![],
                outbox: vec![],
                author: "alice".into(),
                message: "init".into(),
            })
            .unwrap();

        ontology.create_branch(name("feature"), Some(name("main"))).unwrap();
        assert_eq!(ontology.branches().get(&name("feature")).unwrap().head, Some(hash));
    }

    #[test]
    fn committing_stages_outbox_rows_for_the_repo() {
        let ontology = OntologyBuilder::default().build();
        ontology.create_branch(name("main"), None).unwrap();
        ontology
            .commit(WriteRequest {
                branch: name("main"),
                scope: LockScope::Branch,
                tree: SchemaTree::new(),
                versions: vec![],
                outbox: vec![OutboxDraft {
                    event_type: "com.oms.schema.changed".into(),
                    payload: serde_json::json!({}),
                }],
                author: "alice".into(),
                message: "init".into(),
            })
            .unwrap();

        assert_eq!(ontology.outbox().pending(&name("main"), 10).len(), 1);
    }
}
