//! Lock scopes, lock types, and the conflict matrix between them

use oms_core::{ResourceId, ResourceType};
use serde::{Deserialize, Serialize};

/// What a lock protects.
///
/// Scopes nest: a `Branch` lock conflicts with everything on that
/// branch; a `ResourceType` lock conflicts with itself and any
/// `ResourceId` lock of the same type; a `ResourceId` lock conflicts
/// only with an exact match (or a broader lock covering it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    /// The entire branch.
    Branch,
    /// Every resource of one type on the branch.
    ResourceType(ResourceType),
    /// One specific resource on the branch.
    ResourceId(ResourceType, ResourceId),
}

impl LockScope {
    /// Whether `self` and `other` can both be held at the same time.
    ///
    /// Implements the conflict matrix verbatim: two scopes conflict iff
    /// one contains the other (including being equal).
    pub fn conflicts_with(&self, other: &LockScope) -> bool {
        match (self, other) {
            (LockScope::Branch, _) | (_, LockScope::Branch) => true,
            (LockScope::ResourceType(a), LockScope::ResourceType(b)) => a == b,
            (LockScope::ResourceType(a), LockScope::ResourceId(b, _))
            | (LockScope::ResourceId(b, _), LockScope::ResourceType(a)) => a == b,
            (LockScope::ResourceId(ta, ia), LockScope::ResourceId(tb, ib)) => {
                ta == tb && ia == ib
            }
        }
    }
}

/// Why a lock was taken, used to decide which background agents may
/// acquire compatible locks concurrently (e.g. two `Indexing` locks on
/// disjoint resource types never conflict; a `Manual` lock always does
/// since a human operator's intent shouldn't be second-guessed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Held while a shadow index build/switch is in progress.
    Indexing,
    /// Held during maintenance operations (compaction, GC).
    Maintenance,
    /// Held by an operator for an out-of-band reason.
    Manual,
    /// Held while a merge is being computed and applied.
    Merge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_scope_conflicts_with_everything() {
        let branch = LockScope::Branch;
        let rt = LockScope::ResourceType(ResourceType::Property);
        let rid = LockScope::ResourceId(ResourceType::Property, ResourceId::new("age").unwrap());
        assert!(branch.conflicts_with(&rt));
        assert!(branch.conflicts_with(&rid));
        assert!(branch.conflicts_with(&branch));
    }

    #[test]
    fn resource_type_conflicts_with_same_type_and_its_members() {
        let a = LockScope::ResourceType(ResourceType::Property);
        let b = LockScope::ResourceType(ResourceType::Property);
        let c = LockScope::ResourceType(ResourceType::ObjectType);
        let member = LockScope::ResourceId(ResourceType::Property, ResourceId::new("age").unwrap());
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
        assert!(a.conflicts_with(&member));
    }

    #[test]
    fn disjoint_resource_ids_do_not_conflict() {
        let a = LockScope::ResourceId(ResourceType::Property, ResourceId::new("age").unwrap());
        let b = LockScope::ResourceId(ResourceType::Property, ResourceId::new("name").unwrap());
        assert!(!a.conflicts_with(&b));
        assert!(a.conflicts_with(&a.clone()));
    }

    #[test]
    fn different_resource_types_never_conflict() {
        let a = LockScope::ResourceId(ResourceType::Property, ResourceId::new("age").unwrap());
        let b = LockScope::ResourceId(ResourceType::ObjectType, ResourceId::new("age").unwrap());
        assert!(!a.conflicts_with(&b));
    }
}
