//! Lock table and acquisition/release/heartbeat operations
//!
//! Grounded on the per-branch serialization pattern a transaction
//! manager typically uses to prevent TOCTOU races on a shared resource:
//! every mutation to a branch's lock list happens under that branch's
//! own entry in a `DashMap`, so branches never contend with each other.

use crate::lock::BranchLock;
use crate::scope::{LockScope, LockType};
use dashmap::DashMap;
use oms_core::{BranchName, Error, Result, Timestamp};
use std::time::Duration;

/// Deterministic 64-bit key for a `(branch, scope, holder-independent)`
/// lock target, suitable for handing to an external advisory-lock
/// primitive (e.g. a database's session-level advisory lock) while this
/// in-process table remains the source of truth for scope/holder
/// bookkeeping.
pub fn lock_key(branch: &BranchName, scope: &LockScope) -> u64 {
    let mut input = branch.as_str().to_string();
    input.push('|');
    match scope {
        LockScope::Branch => input.push_str("branch"),
        LockScope::ResourceType(rt) => {
            input.push_str("resource_type|");
            input.push_str(rt.as_str());
        }
        LockScope::ResourceId(rt, rid) => {
            input.push_str("resource_id|");
            input.push_str(rt.as_str());
            input.push('|');
            input.push_str(rid.as_str());
        }
    }
    xxhash_rust::xxh3::xxh3_64(input.as_bytes())
}

/// Parameters for [`LockManager::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Branch to lock.
    pub branch: BranchName,
    /// What to lock.
    pub scope: LockScope,
    /// Why the lock is being taken.
    pub lock_type: LockType,
    /// Identity of the requester.
    pub holder: String,
    /// Lock lifetime; rejected with `Validation` if zero.
    pub ttl: Duration,
    /// Expected heartbeat cadence, if the holder intends to renew the lock.
    pub heartbeat_interval: Option<Duration>,
    /// Whether the sweeper may auto-release this lock once expired.
    pub auto_release: bool,
    /// Human-readable reason, surfaced in conflict errors.
    pub reason: String,
    /// Identity of the service expected to send heartbeats.
    pub heartbeat_source: Option<String>,
}

/// In-process table of held locks, sharded per branch.
pub struct LockManager {
    locks: DashMap<BranchName, Vec<BranchLock>>,
}

impl LockManager {
    /// An empty lock table.
    pub fn new() -> Self {
        LockManager {
            locks: DashMap::new(),
        }
    }

    /// Acquire a lock, or reentrantly bump the refcount of an identical
    /// `(branch, scope, holder)` lock already held by the same holder.
    pub fn acquire(&self, req: AcquireRequest, now: Timestamp) -> Result<BranchLock> {
        if req.ttl.is_zero() {
            return Err(Error::Validation {
                message: "lock ttl must be greater than zero".into(),
            });
        }

        let mut entry = self.locks.entry(req.branch.clone()).or_default();

        if let Some(existing) = entry
            .iter_mut()
            .find(|l| l.scope == req.scope && l.holder == req.holder)
        {
            existing.refcount += 1;
            existing.expires_at = Timestamp::from_datetime(now.as_datetime() + chrono::Duration::from_std(req.ttl).unwrap_or_default());
            return Ok(existing.clone());
        }

        if let Some(conflicting) = entry.iter().find(|l| l.scope.conflicts_with(&req.scope)) {
            return Err(Error::LockConflict {
                branch: req.branch.clone(),
                reason: format!(
                    "scope conflicts with lock {} held by {}",
                    conflicting.id, conflicting.holder
                ),
            });
        }

        let lock = BranchLock {
            id: uuid::Uuid::new_v4(),
            branch: req.branch.clone(),
            lock_type: req.lock_type,
            scope: req.scope,
            holder: req.holder,
            acquired_at: now,
            expires_at: Timestamp::from_datetime(now.as_datetime() + chrono::Duration::from_std(req.ttl).unwrap_or_default()),
            heartbeat_interval: req.heartbeat_interval,
            last_heartbeat: None,
            auto_release: req.auto_release,
            reason: req.reason,
            heartbeat_source: req.heartbeat_source,
            refcount: 1,
        };
        entry.push(lock.clone());
        Ok(lock)
    }

    /// Release a lock, decrementing its refcount; the lock is removed
    /// from the table only once the refcount reaches zero.
    pub fn release(&self, branch: &BranchName, lock_id: uuid::Uuid, holder: &str) -> Result<()> {
        let mut entry = self.locks.entry(branch.clone()).or_default();
        let position = entry.iter().position(|l| l.id == lock_id);
        let Some(position) = position else {
            return Err(Error::NotFound {
                what: "lock",
                id: lock_id.to_string(),
            });
        };
        if entry[position].holder != holder {
            return Err(Error::NotOwner {
                lock_id: lock_id.to_string(),
                holder: holder.to_string(),
            });
        }
        entry[position].refcount = entry[position].refcount.saturating_sub(1);
        if entry[position].refcount == 0 {
            entry.remove(position);
        }
        Ok(())
    }

    /// Record a heartbeat, extending the lock's expiry by `ttl`.
    pub fn heartbeat(
        &self,
        branch: &BranchName,
        lock_id: uuid::Uuid,
        holder: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<()> {
        let mut entry = self.locks.entry(branch.clone()).or_default();
        let lock = entry
            .iter_mut()
            .find(|l| l.id == lock_id)
            .ok_or_else(|| Error::NotFound {
                what: "lock",
                id: lock_id.to_string(),
            })?;
        if lock.holder != holder {
            return Err(Error::NotOwner {
                lock_id: lock_id.to_string(),
                holder: holder.to_string(),
            });
        }
        lock.last_heartbeat = Some(now);
        lock.expires_at = Timestamp::from_datetime(now.as_datetime() + chrono::Duration::from_std(ttl).unwrap_or_default());
        Ok(())
    }

    /// All locks currently held on `branch`.
    pub fn list_active(&self, branch: &BranchName) -> Vec<BranchLock> {
        self.locks.get(branch).map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether a write to `scope` on `branch` is currently permitted,
    /// i.e. no held lock conflicts with it. Called by the branch
    /// registry before any write lands, per the write-admission check.
    pub fn check_write_permission(&self, branch: &BranchName, scope: &LockScope) -> Result<()> {
        let entry = self.locks.get(branch);
        if let Some(locks) = entry {
            if let Some(conflicting) = locks.iter().find(|l| l.scope.conflicts_with(scope)) {
                return Err(Error::WriteLocked {
                    branch: branch.clone(),
                    reason: format!(
                        "conflicts with {:?} lock {} held by {}",
                        conflicting.lock_type, conflicting.id, conflicting.holder
                    ),
                });
            }
        }
        Ok(())
    }

    /// Remove and return every lock on `branch` that is expired or has
    /// a stale heartbeat and is marked `auto_release`. Used by the sweeper.
    pub fn sweep_branch(&self, branch: &BranchName, now: Timestamp, missed_allowance: u32) -> Vec<BranchLock> {
        let mut entry = self.locks.entry(branch.clone()).or_default();
        let mut released = Vec::new();
        entry.retain(|lock| {
            let stale = lock.auto_release
                && (lock.is_expired(now) || lock.is_heartbeat_stale(now, missed_allowance));
            if stale {
                released.push(lock.clone());
            }
            !stale
        });
        released
    }

    /// Every branch with at least one lock currently held.
    pub fn branches_with_locks(&self) -> Vec<BranchName> {
        self.locks
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_core::{ResourceId, ResourceType};

    fn branch() -> BranchName {
        BranchName::new("main").unwrap()
    }

    fn base_request(holder: &str) -> AcquireRequest {
        AcquireRequest {
            branch: branch(),
            scope: LockScope::Branch,
            lock_type: LockType::Manual,
            holder: holder.to_string(),
            ttl: Duration::from_secs(60),
            heartbeat_interval: None,
            auto_release: true,
            reason: "testing".into(),
            heartbeat_source: None,
        }
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mgr = LockManager::new();
        let mut req = base_request("alice");
        req.ttl = Duration::ZERO;
        assert!(matches!(mgr.acquire(req, Timestamp::now()), Err(Error::Validation { .. })));
    }

    #[test]
    fn conflicting_scope_is_rejected() {
        let mgr = LockManager::new();
        mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        let result = mgr.acquire(base_request("bob"), Timestamp::now());
        assert!(matches!(result, Err(Error::LockConflict { .. })));
    }

    #[test]
    fn reentrant_acquire_bumps_refcount_instead_of_erroring() {
        let mgr = LockManager::new();
        let first = mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        let second = mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.refcount, 2);
    }

    #[test]
    fn release_requires_matching_holder() {
        let mgr = LockManager::new();
        let lock = mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        let result = mgr.release(&branch(), lock.id, "bob");
        assert!(matches!(result, Err(Error::NotOwner { .. })));
    }

    #[test]
    fn release_removes_lock_once_refcount_hits_zero() {
        let mgr = LockManager::new();
        let lock = mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        mgr.acquire(base_request("alice"), Timestamp::now()).unwrap();
        mgr.release(&branch(), lock.id, "alice").unwrap();
        assert_eq!(mgr.list_active(&branch()).len(), 1);
        mgr.release(&branch(), lock.id, "alice").unwrap();
        assert!(mgr.list_active(&branch()).is_empty());
    }

    #[test]
    fn write_permission_respects_scope_overlap() {
        let mgr = LockManager::new();
        let mut req = base_request("alice");
        req.scope = LockScope::ResourceId(ResourceType::Property, ResourceId::new("age").unwrap());
        mgr.acquire(req, Timestamp::now()).unwrap();

        let disjoint = LockScope::ResourceId(ResourceType::Property, ResourceId::new("name").unwrap());
        assert!(mgr.check_write_permission(&branch(), &disjoint).is_ok());

        let overlapping = LockScope::ResourceType(ResourceType::Property);
        assert!(matches!(
            mgr.check_write_permission(&branch(), &overlapping),
            Err(Error::WriteLocked { .. })
        ));
    }

    #[test]
    fn sweep_only_removes_expired_auto_release_locks() {
        let mgr = LockManager::new();
        let now = Timestamp::now();
        let mut expiring = base_request("alice");
        expiring.scope = LockScope::ResourceType(ResourceType::Property);
        expiring.ttl = Duration::from_secs(1);
        mgr.acquire(expiring, now).unwrap();

        let mut sticky = base_request("bob");
        sticky.scope = LockScope::ResourceType(ResourceType::ObjectType);
        sticky.auto_release = false;
        sticky.ttl = Duration::from_secs(1);
        mgr.acquire(sticky, now).unwrap();

        let later = Timestamp::from_datetime(now.as_datetime() + chrono::Duration::seconds(5));
        let released = mgr.sweep_branch(&branch(), later, 3);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].holder, "alice");
        assert_eq!(mgr.list_active(&branch()).len(), 1);
    }
}
