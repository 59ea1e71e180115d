//! Cross-site dependency tracking for a coordinator.

use crate::TxnError;
use lockstep_types::{DependencyId, PartitionId, SiteId, Table, TxnId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[derive(Debug, Clone, Default)]
struct DependencyEntry {
    /// Sites still owing a result.
    outstanding: BTreeSet<SiteId>,
    results: BTreeMap<SiteId, (PartitionId, Table)>,
}

/// Results expected from, and received from, each site for each dependency.
#[derive(Debug, Clone, Default)]
pub struct DependencyTracker {
    deps: BTreeMap<DependencyId, DependencyEntry>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect a result for `dep` from each listed site.
    pub fn expect(&mut self, dep: DependencyId, sites: impl IntoIterator<Item = SiteId>) {
        let entry = self.deps.entry(dep).or_default();
        entry.outstanding.extend(sites);
    }

    /// Record one site's result. Returns false for a result nobody expected
    /// (duplicate or from a site no longer participating).
    pub fn record(
        &mut self,
        dep: DependencyId,
        site: SiteId,
        partition: PartitionId,
        table: Table,
    ) -> bool {
        let Some(entry) = self.deps.get_mut(&dep) else {
            warn!(dep = %dep, site = %site, "Result for an unknown dependency");
            return false;
        };
        if !entry.outstanding.remove(&site) {
            return false;
        }
        entry.results.insert(site, (partition, table));
        true
    }

    /// Stop waiting on dead sites. Results they already sent are kept.
    ///
    /// Idempotent.
    pub fn remove_sites(&mut self, failed: &BTreeSet<SiteId>) {
        for entry in self.deps.values_mut() {
            entry.outstanding.retain(|site| !failed.contains(site));
        }
    }

    /// Sites still owing a result for `dep`.
    pub fn outstanding(&self, dep: DependencyId) -> usize {
        self.deps.get(&dep).map_or(0, |e| e.outstanding.len())
    }

    pub fn is_satisfied(&self, dep: DependencyId) -> bool {
        self.outstanding(dep) == 0
    }

    pub fn all_satisfied(&self) -> bool {
        self.deps.values().all(|e| e.outstanding.is_empty())
    }

    /// One table per partition, in partition order.
    ///
    /// Every replica of a partition must have produced the same table.
    pub fn tables_by_partition(
        &self,
        txn_id: TxnId,
        dep: DependencyId,
    ) -> Result<Vec<Table>, TxnError> {
        let Some(entry) = self.deps.get(&dep) else {
            return Ok(Vec::new());
        };
        let mut by_partition: BTreeMap<PartitionId, &Table> = BTreeMap::new();
        for (partition, table) in entry.results.values() {
            match by_partition.get(partition) {
                Some(existing) if *existing != table => {
                    return Err(TxnError::ReplicaDivergence {
                        txn_id,
                        dep,
                        partition: *partition,
                    });
                }
                Some(_) => {}
                None => {
                    by_partition.insert(*partition, table);
                }
            }
        }
        Ok(by_partition.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(ids: &[u64]) -> BTreeSet<SiteId> {
        ids.iter().map(|i| SiteId(*i)).collect()
    }

    #[test]
    fn test_satisfied_once_every_site_reports() {
        let dep = DependencyId(1);
        let mut tracker = DependencyTracker::new();
        tracker.expect(dep, [SiteId(1), SiteId(2), SiteId(3)]);
        assert_eq!(tracker.outstanding(dep), 3);

        assert!(tracker.record(dep, SiteId(1), PartitionId(0), Table::scalar(1)));
        assert!(!tracker.record(dep, SiteId(1), PartitionId(0), Table::scalar(1)));
        assert!(tracker.record(dep, SiteId(3), PartitionId(1), Table::scalar(2)));
        assert!(!tracker.is_satisfied(dep));

        tracker.remove_sites(&failed(&[2]));
        tracker.remove_sites(&failed(&[2]));
        assert!(tracker.all_satisfied());
        assert_eq!(
            tracker.tables_by_partition(TxnId(5), dep).unwrap(),
            vec![Table::scalar(1), Table::scalar(2)]
        );
    }

    #[test]
    fn test_replicas_are_merged_and_must_agree() {
        let dep = DependencyId(0);
        let mut tracker = DependencyTracker::new();
        tracker.expect(dep, [SiteId(1), SiteId(2)]);
        tracker.record(dep, SiteId(1), PartitionId(0), Table::scalar(4));
        tracker.record(dep, SiteId(2), PartitionId(0), Table::scalar(4));
        assert_eq!(
            tracker.tables_by_partition(TxnId(9), dep).unwrap(),
            vec![Table::scalar(4)]
        );

        let mut diverged = DependencyTracker::new();
        diverged.expect(dep, [SiteId(1), SiteId(2)]);
        diverged.record(dep, SiteId(1), PartitionId(0), Table::scalar(4));
        diverged.record(dep, SiteId(2), PartitionId(0), Table::scalar(5));
        let err = diverged.tables_by_partition(TxnId(9), dep).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unexpected_results_are_ignored() {
        let mut tracker = DependencyTracker::new();
        assert!(!tracker.record(DependencyId(3), SiteId(1), PartitionId(0), Table::empty()));
        tracker.expect(DependencyId(3), [SiteId(1)]);
        assert!(!tracker.record(DependencyId(3), SiteId(7), PartitionId(0), Table::empty()));
        assert_eq!(tracker.outstanding(DependencyId(3)), 1);
    }
}
