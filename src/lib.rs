//! Top-level crate re-exporting the OMS workspace members.

pub use oms_core as core;
pub use oms_engine as engine;
pub use oms_locks as locks;
pub use oms_outbox as outbox;
pub use oms_storage as storage;

pub use oms_api::*;
