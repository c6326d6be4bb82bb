//! Branch registry: branch metadata and the branch lifecycle state machine

use dashmap::DashMap;
use oms_core::{BranchName, CommitHash, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A branch's position in its lifecycle.
///
/// Transitions not named in [`BranchState::transition`] are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Normal state: accepts reads and writes.
    Active,
    /// A write-scope lock is held; writes are rejected, reads proceed.
    LockedForWrite,
    /// A merge into or out of this branch is in progress.
    Merging,
    /// Read-only, retired from normal traffic.
    Archived,
    /// Every index required for this branch reports `Active`. Reachable
    /// from any non-archived state; leaving it follows the same edges
    /// as leaving `Active`.
    Ready,
}

impl BranchState {
    /// Attempt the transition `self -> to`, per the lifecycle table.
    pub fn transition(self, to: BranchState) -> Result<BranchState> {
        use BranchState::*;
        let allowed = matches!(
            (self, to),
            (Active, LockedForWrite)
                | (LockedForWrite, Active)
                | (Active, Merging)
                | (Merging, Active)
                | (Active, Archived)
                | (LockedForWrite, Archived)
                | (Active, Ready)
                | (LockedForWrite, Ready)
                | (Merging, Ready)
                | (Ready, Active)
                | (Ready, LockedForWrite)
                | (Ready, Merging)
                | (Ready, Archived)
        );
        if allowed {
            Ok(to)
        } else {
            Err(Error::Validation {
                message: format!("illegal branch state transition: {self:?} -> {to:?}"),
            })
        }
    }
}

/// Flags governing what is allowed on a branch regardless of its state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtectionFlags {
    /// Direct commits are rejected; changes must land via merge.
    pub require_merge: bool,
    /// The branch cannot be deleted while this is set.
    pub prevent_deletion: bool,
}

/// A branch: a named, mutable pointer into the commit DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// The branch's name.
    pub name: BranchName,
    /// Current head commit, `None` until the first commit lands.
    pub head: Option<CommitHash>,
    /// Current lifecycle state.
    pub state: BranchState,
    /// Protection flags.
    pub protection: ProtectionFlags,
    /// The branch this one was forked from, if any.
    pub parent: Option<BranchName>,
}

impl Branch {
    /// A freshly created branch with no commits yet.
    pub fn new(name: BranchName, parent: Option<BranchName>) -> Self {
        Branch {
            name,
            head: None,
            state: BranchState::Active,
            protection: ProtectionFlags::default(),
            parent,
        }
    }
}

/// `DashMap`-backed table of branches, each independently lockable so
/// operations on different branches never contend — mirrors the
/// per-branch-`Mutex` pattern a transaction manager uses for commit
/// serialization, applied here to branch metadata instead of commits.
pub struct BranchRegistry {
    branches: DashMap<BranchName, Arc<RwLock<Branch>>>,
}

impl BranchRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        BranchRegistry {
            branches: DashMap::new(),
        }
    }

    /// Register a new branch. Fails with `NameTaken` if one already exists.
    pub fn create(&self, branch: Branch) -> Result<()> {
        if self.branches.contains_key(&branch.name) {
            return Err(Error::NameTaken(branch.name.clone()));
        }
        self.branches.insert(branch.name.clone(), Arc::new(RwLock::new(branch)));
        Ok(())
    }

    /// Fetch a branch's current snapshot.
    pub fn get(&self, name: &BranchName) -> Result<Branch> {
        self.branches
            .get(name)
            .map(|b| b.read().clone())
            .ok_or_else(|| Error::NotFound {
                what: "branch",
                id: name.to_string(),
            })
    }

    /// Every registered branch name.
    pub fn list(&self) -> Vec<BranchName> {
        self.branches.iter().map(|e| e.key().clone()).collect()
    }

    /// CAS-advance a branch's head: succeeds only if the branch's
    /// current head equals `expected_head`, otherwise fails `StaleHead`.
    pub fn advance(
        &self,
        name: &BranchName,
        expected_head: Option<&CommitHash>,
        new_head: CommitHash,
    ) -> Result<()> {
        let entry = self.branches.get(name).ok_or_else(|| Error::NotFound {
            what: "branch",
            id: name.to_string(),
        })?;
        let mut branch = entry.write();

        if branch.head.as_ref() != expected_head {
            return Err(Error::StaleHead {
                branch: name.clone(),
                expected: expected_head.map(|h| h.to_string()).unwrap_or_else(|| "none".into()),
                actual: branch.head.as_ref().map(|h| h.to_string()).unwrap_or_else(|| "none".into()),
            });
        }

        branch.head = Some(new_head);
        Ok(())
    }

    /// Transition a branch's lifecycle state.
    pub fn transition_state(&self, name: &BranchName, to: BranchState) -> Result<()> {
        let entry = self.branches.get(name).ok_or_else(|| Error::NotFound {
            what: "branch",
            id: name.to_string(),
        })?;
        let mut branch = entry.write();
        branch.state = branch.state.transition(to)?;
        Ok(())
    }

    /// Remove a branch. Fails if `prevent_deletion` is set, or if the
    /// branch isn't `Archived` yet.
    pub fn delete(&self, name: &BranchName) -> Result<()> {
        let entry = self.branches.get(name).ok_or_else(|| Error::NotFound {
            what: "branch",
            id: name.to_string(),
        })?;
        let branch = entry.read();
        if branch.protection.prevent_deletion {
            return Err(Error::Validation {
                message: format!("branch {name} is protected from deletion"),
            });
        }
        if branch.state != BranchState::Archived {
            return Err(Error::Validation {
                message: format!("branch {name} must be archived before deletion (currently {:?})", branch.state),
            });
        }
        drop(branch);
        drop(entry);
        self.branches.remove(name);
        Ok(())
    }
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> BranchName {
        BranchName::new(s).unwrap()
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let registry = BranchRegistry::new();
        registry.create(Branch::new(name("main"), None)).unwrap();
        let result = registry.create(Branch::new(name("main"), None));
        assert!(matches!(result, Err(Error::NameTaken(_))));
    }

    #[test]
    fn advance_enforces_cas_on_expected_head() {
        let registry = BranchRegistry::new();
        registry.create(Branch::new(name("main"), None)).unwrap();
        let c1 = CommitHash::compute(b"c1");
        registry.advance(&name("main"), None, c1.clone()).unwrap();
        assert_eq!(registry.get(&name("main")).unwrap().head, Some(c1));

        let c2 = CommitHash::compute(b"c2");
        let stale = registry.advance(&name("main"), None, c2);
        assert!(matches!(stale, Err(Error::StaleHead { .. })));
    }

    #[test]
    fn illegal_state_transition_is_rejected() {
        let registry = BranchRegistry::new();
        registry.create(Branch::new(name("main"), None)).unwrap();
        registry.transition_state(&name("main"), BranchState::Archived).unwrap();
        let result = registry.transition_state(&name("main"), BranchState::LockedForWrite);
        assert!(result.is_err());
    }

    #[test]
    fn lock_and_unlock_round_trip() {
        let registry = BranchRegistry::new();
        registry.create(Branch::new(name("main"), None)).unwrap();
        registry.advance(&name("main"), None, CommitHash::compute(b"c1")).unwrap();
        registry.transition_state(&name("main"), BranchState::LockedForWrite).unwrap();
        assert_eq!(registry.get(&name("main")).unwrap().state, BranchState::LockedForWrite);
        registry.transition_state(&name("main"), BranchState::Active).unwrap();
        assert_eq!(registry.get(&name("main")).unwrap().state, BranchState::Active);
    }

    #[test]
    fn protected_branch_cannot_be_deleted() {
        let registry = BranchRegistry::new();
        let mut branch = Branch::new(name("main"), None);
        branch.protection.prevent_deletion = true;
        registry.create(branch).unwrap();
        registry.transition_state(&name("main"), BranchState::Archived).unwrap();
        assert!(registry.delete(&name("main")).is_err());
    }

    #[test]
    fn only_archived_branches_can_be_deleted() {
        let registry = BranchRegistry::new();
        registry.create(Branch::new(name("main"), None)).unwrap();

        assert!(registry.delete(&name("main")).is_err());

        registry.transition_state(&name("main"), BranchState::Archived).unwrap();
        registry.delete(&name("main")).unwrap();
        assert!(registry.get(&name("main")).is_err());
    }
}
