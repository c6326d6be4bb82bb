//! Advisory hierarchical lock manager for branches, resource types, and
//! individual resources, with a background sweeper for expired and
//! heartbeat-stale locks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;
pub mod manager;
pub mod scope;
pub mod sweeper;

pub use lock::BranchLock;
pub use manager::{lock_key, AcquireRequest, LockManager};
pub use scope::{LockScope, LockType};
pub use sweeper::{NullSink, OutboxSink, Sweeper};
