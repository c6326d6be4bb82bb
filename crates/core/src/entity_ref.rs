//! Addressing a single resource on a single branch

use crate::types::{BranchName, ResourceId, ResourceType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinates that pin down exactly one resource on exactly one branch.
///
/// Used throughout error messages, delta addressing, and lock scoping —
/// anywhere a caller needs to say "this property, on this branch" rather
/// than just "this property".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// The kind of resource.
    pub resource_type: ResourceType,
    /// The resource's identifier within its type.
    pub resource_id: ResourceId,
    /// The branch the resource is addressed on.
    pub branch: BranchName,
}

impl EntityRef {
    /// Build an `EntityRef` from its three coordinates.
    pub fn new(resource_type: ResourceType, resource_id: ResourceId, branch: BranchName) -> Self {
        EntityRef {
            resource_type,
            resource_id,
            branch,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.resource_type, self.resource_id, self.branch
        )
    }
}
