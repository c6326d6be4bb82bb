//! The lock record itself

use crate::scope::{LockScope, LockType};
use oms_core::{BranchName, Timestamp};
use serde::{Deserialize, Serialize};

/// A held advisory lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchLock {
    /// Unique lock id.
    pub id: uuid::Uuid,
    /// Branch the lock is held against.
    pub branch: BranchName,
    /// Why the lock was taken.
    pub lock_type: LockType,
    /// What the lock protects.
    pub scope: LockScope,
    /// Free-form identity of the holder (service name, operator, agent id).
    pub holder: String,
    /// When the lock was first acquired.
    pub acquired_at: Timestamp,
    /// When the lock expires absent a heartbeat.
    pub expires_at: Timestamp,
    /// Expected interval between heartbeats, if the holder intends to send them.
    pub heartbeat_interval: Option<std::time::Duration>,
    /// Timestamp of the most recent heartbeat, if any.
    pub last_heartbeat: Option<Timestamp>,
    /// Whether the sweeper may auto-release this lock once expired.
    pub auto_release: bool,
    /// Human-readable reason for the lock, surfaced in conflict errors.
    pub reason: String,
    /// Free-form identity of the service sending heartbeats, e.g. `"indexing-service"`.
    pub heartbeat_source: Option<String>,
    /// Reentrant acquisitions of the exact same `(branch, scope, holder)`
    /// bump this instead of erroring; release only actually removes the
    /// lock once it returns to zero.
    pub refcount: u32,
}

impl BranchLock {
    /// Whether this lock has passed its expiry time as of `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_before(now)
    }

    /// Whether the lock's heartbeat is stale: it expects heartbeats,
    /// has missed more than `missed_allowance` of them, and `now` has
    /// moved past that grace window.
    pub fn is_heartbeat_stale(&self, now: Timestamp, missed_allowance: u32) -> bool {
        let Some(interval) = self.heartbeat_interval else {
            return false;
        };
        let reference = self.last_heartbeat.unwrap_or(self.acquired_at);
        let Some(elapsed) = now.duration_since(reference) else {
            return false;
        };
        elapsed > interval * missed_allowance.max(1)
    }
}
