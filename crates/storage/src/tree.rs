//! Commit content: the schema tree a commit snapshots

use oms_core::EntityRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full content a single commit snapshots: every resource on the
/// branch at that point in history, keyed by its [`EntityRef`].
///
/// A `BTreeMap` rather than a `HashMap` because commit hashing requires
/// a stable iteration order (§ commit hash invariant below).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaTree {
    entries: BTreeMap<EntityRef, serde_json::Value>,
}

impl SchemaTree {
    /// An empty tree.
    pub fn new() -> Self {
        SchemaTree::default()
    }

    /// Insert or overwrite the content for one resource.
    pub fn set(&mut self, key: EntityRef, value: serde_json::Value) {
        self.entries.insert(key, value);
    }

    /// Remove a resource's content (used for delete commits).
    pub fn remove(&mut self, key: &EntityRef) -> Option<serde_json::Value> {
        self.entries.remove(key)
    }

    /// Look up a resource's content.
    pub fn get(&self, key: &EntityRef) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Iterate entries in canonical (key-sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityRef, &serde_json::Value)> {
        self.entries.iter()
    }

    /// Number of resources in the tree.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no resources.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Content hash of the whole tree: `sha2` over the canonical
    /// (key-sorted, since `BTreeMap` iteration already is) serialization
    /// of every entry. This is the "tree-root" fed into
    /// [`crate::commit::Commit::compute_hash`].
    pub fn root_hash(&self) -> oms_core::ContentHash {
        let value = serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Null);
        oms_core::ContentHash::compute(&value)
    }

    /// Build a new tree by applying `other` on top of `self`, used when
    /// materializing a branch's tree as base-tree-plus-commits without
    /// replaying the entire history on every read.
    pub fn overlay(&self, other: &SchemaTree) -> SchemaTree {
        let mut merged = self.clone();
        for (k, v) in &other.entries {
            merged.entries.insert(k.clone(), v.clone());
        }
        merged
    }
}
