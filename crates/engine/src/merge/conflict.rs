//! Conflict types, severities, and the two conflict-resolution matrices

use oms_core::{Cardinality, EntityRef, PropertyType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How serious a merge conflict is. Ordered so `max()` over a set of
/// conflicts gives the overall merge's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    /// Informational; always auto-resolvable.
    Info,
    /// Worth flagging; auto-resolvable by policy.
    Warn,
    /// Requires manual resolution; blocks auto-resolve but not the merge outright.
    Error,
    /// Blocks the merge entirely until resolved.
    Block,
}

/// The kind of structural conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A property's type differs between branches.
    PropertyType,
    /// A link's cardinality differs between branches.
    Cardinality,
    /// One branch deleted a resource the other modified.
    DeleteModify,
    /// Two branches independently created a resource with the same name.
    NameCollision,
    /// The merged link graph contains a required-edge cycle.
    CircularDependency,
    /// Two interface definitions for the same type are incompatible.
    InterfaceMismatch,
    /// A constraint on one branch is violated by the other branch's change.
    ConstraintConflict,
}

/// What the merge engine suggests doing about a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// Keep the value from the source branch.
    TakeSource,
    /// Keep the value from the target branch.
    TakeTarget,
    /// Widen to a type/cardinality that accepts both.
    Widen(String),
}

/// How much downstream data migration a resolution would require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationImpact {
    /// No migration needed.
    None,
    /// A cheap, reversible migration (e.g. widening a column type).
    Low,
    /// A migration that may lose precision or require backfill.
    Moderate,
    /// A migration that can lose data outright.
    High,
}

/// One detected conflict between two branches' changes to the same entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    /// Deterministic id, e.g. `prop_type_<resource>_<field>`.
    pub id: String,
    /// What kind of conflict this is.
    pub kind: ConflictKind,
    /// How serious it is.
    pub severity: ConflictSeverity,
    /// The entity the conflict concerns.
    pub entity_ref: EntityRef,
    /// The value on the source (merge-from) branch.
    pub source_value: serde_json::Value,
    /// The value on the target (merge-into) branch.
    pub target_value: serde_json::Value,
    /// Human-readable explanation.
    pub description: String,
    /// Whether the merge engine can resolve this without operator input.
    pub auto_resolvable: bool,
    /// The engine's suggested resolution, if any.
    pub suggested_resolution: Option<Resolution>,
    /// Estimated migration cost of applying the suggested resolution.
    pub migration_impact: Option<MigrationImpact>,
}

/// Severity of a property type change, per the type-widening matrix.
///
/// Widening to a strictly more permissive type is `Info`; narrowing or
/// changing representation incompatibly is `Error`; anything touching
/// JSON that isn't an exact match falls to `Warn` since JSON's shape is
/// opaque to this check.
pub fn property_type_severity(from: &PropertyType, to: &PropertyType) -> ConflictSeverity {
    use PropertyType::*;
    if from == to {
        return ConflictSeverity::Info;
    }
    match (from, to) {
        (String, Text) | (Text, String) => ConflictSeverity::Info,
        (Integer, Long) => ConflictSeverity::Info,
        (Float, Double) => ConflictSeverity::Info,
        (String, Integer) | (Integer, String) => ConflictSeverity::Error,
        (Double, Integer) | (Integer, Double) => ConflictSeverity::Error,
        (Json, _) | (_, Json) => ConflictSeverity::Warn,
        _ => ConflictSeverity::Error,
    }
}

/// Severity (and migration impact) of a cardinality change, per the
/// cardinality-widening matrix.
pub fn cardinality_severity(from: Cardinality, to: Cardinality) -> (ConflictSeverity, Option<MigrationImpact>) {
    use Cardinality::*;
    if from == to {
        return (ConflictSeverity::Info, Some(MigrationImpact::None));
    }
    match (from, to) {
        (OneToOne, OneToMany) => (ConflictSeverity::Info, Some(MigrationImpact::Low)),
        (OneToMany, ManyToMany) => (ConflictSeverity::Warn, Some(MigrationImpact::Moderate)),
        (OneToOne, ManyToMany) => (ConflictSeverity::Warn, Some(MigrationImpact::Moderate)),
        (OneToMany, OneToOne) | (ManyToMany, OneToOne) => {
            (ConflictSeverity::Error, Some(MigrationImpact::High))
        }
        _ => (ConflictSeverity::Error, Some(MigrationImpact::Moderate)),
    }
}

/// A directed "required" edge between two entities in the post-merge link graph.
#[derive(Debug, Clone)]
pub struct RequiredEdge {
    /// The entity the edge starts at.
    pub from: EntityRef,
    /// The entity the edge points to.
    pub to: EntityRef,
}

/// DFS cycle detection over the "required"-edge subgraph. Returns a
/// single `Block`-severity conflict if any cycle exists, covering the
/// first cycle found (merges are re-run after each fix, so reporting
/// every cycle up front isn't necessary).
pub fn detect_circular_dependencies(edges: &[RequiredEdge]) -> Option<MergeConflict> {
    let mut graph: HashMap<EntityRef, Vec<EntityRef>> = HashMap::new();
    for edge in edges {
        graph.entry(edge.from.clone()).or_default().push(edge.to.clone());
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn visit(
        node: &EntityRef,
        graph: &HashMap<EntityRef, Vec<EntityRef>>,
        visited: &mut HashSet<EntityRef>,
        rec_stack: &mut HashSet<EntityRef>,
    ) -> bool {
        if rec_stack.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.clone());
        rec_stack.insert(node.clone());
        if let Some(neighbors) = graph.get(node) {
            for next in neighbors {
                if visit(next, graph, visited, rec_stack) {
                    return true;
                }
            }
        }
        rec_stack.remove(node);
        false
    }

    let nodes: Vec<EntityRef> = graph.keys().cloned().collect();
    for node in nodes {
        if visit(&node, &graph, &mut visited, &mut rec_stack) {
            return Some(MergeConflict {
                id: "circular_dependency".to_string(),
                kind: ConflictKind::CircularDependency,
                severity: ConflictSeverity::Block,
                entity_ref: node,
                source_value: serde_json::Value::Null,
                target_value: serde_json::Value::Null,
                description: "merging these branches would introduce a required-link cycle".to_string(),
                auto_resolvable: false,
                suggested_resolution: None,
                migration_impact: None,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_core::{BranchName, ResourceId, ResourceType};

    fn entity(id: &str) -> EntityRef {
        EntityRef::new(ResourceType::ObjectType, ResourceId::new(id).unwrap(), BranchName::new("main").unwrap())
    }

    #[test]
    fn widening_string_to_text_is_info() {
        assert_eq!(property_type_severity(&PropertyType::String, &PropertyType::Text), ConflictSeverity::Info);
        assert_eq!(property_type_severity(&PropertyType::Text, &PropertyType::String), ConflictSeverity::Info);
        assert_eq!(property_type_severity(&PropertyType::Integer, &PropertyType::Long), ConflictSeverity::Info);
    }

    #[test]
    fn incompatible_representations_are_errors() {
        assert_eq!(property_type_severity(&PropertyType::String, &PropertyType::Integer), ConflictSeverity::Error);
        assert_eq!(property_type_severity(&PropertyType::Double, &PropertyType::Integer), ConflictSeverity::Error);
    }

    #[test]
    fn json_involvement_defaults_to_warn() {
        assert_eq!(property_type_severity(&PropertyType::Json, &PropertyType::Boolean), ConflictSeverity::Warn);
        assert_eq!(property_type_severity(&PropertyType::Json, &PropertyType::String), ConflictSeverity::Warn);
        assert_eq!(property_type_severity(&PropertyType::String, &PropertyType::Json), ConflictSeverity::Warn);
    }

    #[test]
    fn cardinality_widening_is_info_or_warn() {
        assert_eq!(cardinality_severity(Cardinality::OneToOne, Cardinality::OneToMany).0, ConflictSeverity::Info);
        assert_eq!(cardinality_severity(Cardinality::OneToMany, Cardinality::ManyToMany).0, ConflictSeverity::Warn);
        assert_eq!(cardinality_severity(Cardinality::OneToOne, Cardinality::ManyToMany).0, ConflictSeverity::Warn);
    }

    #[test]
    fn cardinality_narrowing_is_error_with_high_impact() {
        let (severity, impact) = cardinality_severity(Cardinality::OneToMany, Cardinality::OneToOne);
        assert_eq!(severity, ConflictSeverity::Error);
        assert_eq!(impact, Some(MigrationImpact::High));
    }

    #[test]
    fn cycle_is_detected() {
        let edges = vec![
            RequiredEdge { from: entity("a"), to: entity("b") },
            RequiredEdge { from: entity("b"), to: entity("c") },
            RequiredEdge { from: entity("c"), to: entity("a") },
        ];
        let conflict = detect_circular_dependencies(&edges);
        assert!(conflict.is_some());
        assert_eq!(conflict.unwrap().severity, ConflictSeverity::Block);
    }

    #[test]
    fn acyclic_graph_has_no_conflict() {
        let edges = vec![
            RequiredEdge { from: entity("a"), to: entity("b") },
            RequiredEdge { from: entity("b"), to: entity("c") },
        ];
        assert!(detect_circular_dependencies(&edges).is_none());
    }

    #[test]
    fn severity_ordering_is_monotonic() {
        assert!(ConflictSeverity::Info < ConflictSeverity::Warn);
        assert!(ConflictSeverity::Warn < ConflictSeverity::Error);
        assert!(ConflictSeverity::Error < ConflictSeverity::Block);
    }
}
