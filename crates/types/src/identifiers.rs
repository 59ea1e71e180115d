//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-site identifier.
///
/// Execution sites and initiators share one id space: an initiator is named
/// by the id of the host it runs on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SiteId(pub u64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Site({})", self.0)
    }
}

/// Partition identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition({})", self.0)
    }
}

/// Identifier of a plan fragment produced by the planner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FragmentId(pub u64);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fragment({})", self.0)
    }
}

/// Identifier of a fragment output that other fragments (or the procedure)
/// consume.
///
/// Procedures use small batch-local ids; the transaction state renumbers them
/// so that every dependency of one transaction is unique.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DependencyId(pub u32);

impl DependencyId {
    /// Get the next dependency id.
    pub fn next(self) -> Self {
        DependencyId(self.0 + 1)
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dep({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_ids_order_numerically() {
        let mut sites = vec![SiteId(10), SiteId(2), SiteId(7)];
        sites.sort();
        assert_eq!(sites, vec![SiteId(2), SiteId(7), SiteId(10)]);
    }

    #[test]
    fn test_dependency_id_next() {
        assert_eq!(DependencyId(4).next(), DependencyId(5));
    }

    #[test]
    fn test_display() {
        assert_eq!(SiteId(3).to_string(), "Site(3)");
        assert_eq!(PartitionId(1).to_string(), "Partition(1)");
        assert_eq!(FragmentId(9).to_string(), "Fragment(9)");
    }
}
