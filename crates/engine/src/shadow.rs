//! Shadow index build and atomic-switch coordination

use oms_core::{BranchName, CommitHash, Error, ResourceType, Result, Timestamp};
use oms_locks::{AcquireRequest, LockManager, LockScope, LockType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Where a shadow index is in its build/switch/retire lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowState {
    /// Being populated in the background; not yet safe to read.
    Building,
    /// Fully populated and validated, awaiting promotion.
    Built,
    /// Actively promoting `shadow_path` to `current_path`.
    Switching,
    /// Promoted; now serving reads.
    Active,
    /// Build or switch was cancelled before completion.
    Cancelled,
    /// Build or switch failed.
    Failed,
}

/// A shadow index: an index built off to the side of the live one so it
/// can be validated before readers ever see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowIndex {
    /// Unique id for this build.
    pub id: Uuid,
    /// Branch this index covers.
    pub branch: BranchName,
    /// Index kind, e.g. `"full_text"` or `"graph"`.
    pub index_type: String,
    /// Resource types included in the index.
    pub resource_types: Vec<ResourceType>,
    /// Current lifecycle state.
    pub state: ShadowState,
    /// Build progress, 0-100, monotonically non-decreasing.
    pub progress: u8,
    /// Staging path the build writes to.
    pub shadow_path: PathBuf,
    /// Path readers currently observe.
    pub current_path: PathBuf,
    /// Snapshot of `current_path` taken before a switch, if requested.
    pub backup_path: Option<PathBuf>,
    /// Size of the built index in bytes.
    pub size_bytes: u64,
    /// Number of records indexed.
    pub record_count: u64,
    /// Checksum of the built index, recomputed and compared at switch time.
    pub checksum: Option<String>,
    /// When the build started.
    pub created_at: Timestamp,
    /// When the build finished, if it has.
    pub completed_at: Option<Timestamp>,
    /// When the switch completed, if it has.
    pub switched_at: Option<Timestamp>,
}

impl ShadowIndex {
    fn new(branch: BranchName, index_type: String, resource_types: Vec<ResourceType>, shadow_path: PathBuf, current_path: PathBuf) -> Self {
        ShadowIndex {
            id: Uuid::new_v4(),
            branch,
            index_type,
            resource_types,
            state: ShadowState::Building,
            progress: 0,
            shadow_path,
            current_path,
            backup_path: None,
            size_bytes: 0,
            record_count: 0,
            checksum: None,
            created_at: Timestamp::now(),
            completed_at: None,
            switched_at: None,
        }
    }
}

/// Parameters for [`ShadowIndexCoordinator::switch`].
#[derive(Debug, Clone, Default)]
pub struct SwitchRequest {
    /// Whether to run the record-count/checksum validation checks at all.
    pub validation_checks: bool,
    /// Skip the "at least one record" check (used for intentionally empty indexes).
    pub force_switch: bool,
    /// How long the promotion is allowed to hold the indexing lock.
    pub switch_timeout_seconds: u64,
}

/// The result of a switch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchResult {
    /// Whether the switch promoted the shadow index.
    pub success: bool,
    /// Explanation, populated on failure.
    pub message: Option<String>,
    /// When the switch completed, if it succeeded.
    pub switched_at: Option<Timestamp>,
}

/// Coordinates shadow-index builds and their atomic promotion into the
/// live index path, one per `(branch, index_type)` pair.
pub struct ShadowIndexCoordinator {
    indexes: Mutex<HashMap<(BranchName, String), ShadowIndex>>,
    locks: Arc<LockManager>,
}

impl ShadowIndexCoordinator {
    /// A coordinator backed by the given lock manager (shared with the
    /// rest of the ontology so an indexing lock is visible to writers too).
    pub fn new(locks: Arc<LockManager>) -> Self {
        ShadowIndexCoordinator {
            indexes: Mutex::new(HashMap::new()),
            locks,
        }
    }

    /// Begin a new build. Fails `DuplicateBuild` if one is already
    /// `Building` for this `(branch, index_type)` pair.
    pub fn start_build(
        &self,
        branch: BranchName,
        index_type: String,
        resource_types: Vec<ResourceType>,
        shadow_path: PathBuf,
        current_path: PathBuf,
    ) -> Result<Uuid> {
        let mut indexes = self.indexes.lock();
        let key = (branch.clone(), index_type.clone());
        if let Some(existing) = indexes.get(&key) {
            if existing.state == ShadowState::Building {
                return Err(Error::DuplicateBuild {
                    branch,
                    index_type,
                });
            }
        }
        let index = ShadowIndex::new(branch, index_type, resource_types, shadow_path, current_path);
        let id = index.id;
        indexes.insert(key, index);
        Ok(id)
    }

    /// Advance a build's progress. Later calls with a lower percent than
    /// already recorded are clamped rather than allowed to regress.
    pub fn update_progress(&self, id: Uuid, percent: u8) -> Result<()> {
        let mut indexes = self.indexes.lock();
        let index = find_mut(&mut indexes, id)?;
        index.progress = index.progress.max(percent.min(100));
        Ok(())
    }

    /// Mark a build complete: `Building -> Built`, stamping the final stats.
    pub fn complete_build(&self, id: Uuid, size_bytes: u64, record_count: u64, checksum: String) -> Result<()> {
        let mut indexes = self.indexes.lock();
        let index = find_mut(&mut indexes, id)?;
        if index.state != ShadowState::Building {
            return Err(Error::Validation {
                message: format!("cannot complete a build in state {:?}", index.state),
            });
        }
        index.state = ShadowState::Built;
        index.progress = 100;
        index.size_bytes = size_bytes;
        index.record_count = record_count;
        index.checksum = Some(checksum);
        index.completed_at = Some(Timestamp::now());
        Ok(())
    }

    /// Promote a built shadow index into place.
    ///
    /// Takes a branch-scope `Indexing` lock for the duration of the
    /// promotion so writers and other switches observe either the
    /// pre-switch or post-switch state, never a partial one. Any
    /// validation failure rolls the state back to `Built` without
    /// touching the filesystem.
    pub fn switch(&self, id: Uuid, req: SwitchRequest) -> Result<SwitchResult> {
        let branch = {
            let indexes = self.indexes.lock();
            let index = find(&indexes, id)?;
            index.branch.clone()
        };

        let lock = self.locks.acquire(
            AcquireRequest {
                branch: branch.clone(),
                scope: LockScope::Branch,
                lock_type: LockType::Indexing,
                holder: format!("shadow-switch-{id}"),
                ttl: Duration::from_secs(req.switch_timeout_seconds.max(1)),
                heartbeat_interval: None,
                auto_release: true,
                reason: "shadow index switch".into(),
                heartbeat_source: None,
            },
            Timestamp::now(),
        )?;

        let result = self.do_switch(id, &req);

        let _ = self.locks.release(&branch, lock.id, &lock.holder);
        result
    }

    fn do_switch(&self, id: Uuid, req: &SwitchRequest) -> Result<SwitchResult> {
        {
            let mut indexes = self.indexes.lock();
            let index = find_mut(&mut indexes, id)?;
            if index.state != ShadowState::Built {
                return Err(Error::Validation {
                    message: format!("cannot switch a build in state {:?}", index.state),
                });
            }
            index.state = ShadowState::Switching;
        }

        let rollback = |coordinator: &Self, message: String| -> Result<SwitchResult> {
            let mut indexes = coordinator.indexes.lock();
            if let Ok(index) = find_mut(&mut indexes, id) {
                index.state = ShadowState::Built;
            }
            Ok(SwitchResult {
                success: false,
                message: Some(message),
                switched_at: None,
            })
        };

        let (record_count, shadow_path, current_path, checksum) = {
            let indexes = self.indexes.lock();
            let index = find(&indexes, id)?;
            (index.record_count, index.shadow_path.clone(), index.current_path.clone(), index.checksum.clone())
        };

        if req.validation_checks && record_count == 0 && !req.force_switch {
            return rollback(self, "shadow index switch rejected: no records in the built index".into());
        }

        if req.validation_checks {
            match &checksum {
                None => {
                    return rollback(self, "shadow index switch rejected: build has no checksum".into());
                }
                Some(expected) => {
                    let bytes = match std::fs::read(&shadow_path) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            return rollback(self, format!("shadow index switch rejected: could not read shadow index for checksum verification: {e}"));
                        }
                    };
                    let actual = CommitHash::compute(&bytes).to_string();
                    if &actual != expected {
                        return rollback(self, "shadow index switch rejected: checksum mismatch".into());
                    }
                }
            }
        }

        if let Some(backup) = snapshot_current(&current_path) {
            let mut indexes = self.indexes.lock();
            if let Ok(index) = find_mut(&mut indexes, id) {
                index.backup_path = Some(backup);
            }
        }

        if let Err(e) = promote(&shadow_path, &current_path) {
            return rollback(self, format!("shadow index switch failed during promotion: {e}"));
        }

        let mut indexes = self.indexes.lock();
        let index = find_mut(&mut indexes, id)?;
        index.state = ShadowState::Active;
        index.switched_at = Some(Timestamp::now());
        Ok(SwitchResult {
            success: true,
            message: None,
            switched_at: index.switched_at,
        })
    }

    /// Cancel a build or pending switch. Allowed from any state except `Active`.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let mut indexes = self.indexes.lock();
        let index = find_mut(&mut indexes, id)?;
        if index.state == ShadowState::Active {
            return Err(Error::Validation {
                message: "cannot cancel an already-active index".into(),
            });
        }
        index.state = ShadowState::Cancelled;
        let _ = std::fs::remove_file(&index.shadow_path);
        Ok(())
    }

    /// Snapshot of a shadow index's current state.
    pub fn get(&self, id: Uuid) -> Result<ShadowIndex> {
        let indexes = self.indexes.lock();
        find(&indexes, id).cloned()
    }
}

fn find(indexes: &HashMap<(BranchName, String), ShadowIndex>, id: Uuid) -> Result<&ShadowIndex> {
    indexes
        .values()
        .find(|i| i.id == id)
        .ok_or_else(|| Error::NotFound {
            what: "shadow index",
            id: id.to_string(),
        })
}

fn find_mut(indexes: &mut HashMap<(BranchName, String), ShadowIndex>, id: Uuid) -> Result<&mut ShadowIndex> {
    indexes
        .values_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| Error::NotFound {
            what: "shadow index",
            id: id.to_string(),
        })
}

fn snapshot_current(current_path: &Path) -> Option<PathBuf> {
    if !current_path.exists() {
        return None;
    }
    let backup = current_path.with_extension("bak");
    std::fs::copy(current_path, &backup).ok().map(|_| backup)
}

/// Atomic rename where possible; falls back to copy-then-replace when the
/// paths span filesystems (`rename` returns `EXDEV`).
fn promote(shadow_path: &Path, current_path: &Path) -> std::io::Result<()> {
    match std::fs::rename(shadow_path, current_path) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(shadow_path, current_path)?;
            std::fs::remove_file(shadow_path)?;
            Ok(())
        }
    }
}
