//! Fault discovery: survivors exchange what they know until they agree.
//!
//! ```text
//!  SiteFailureFault {3}            FailureSiteUpdate from every survivor
//!  ─────────────────────► discover ───────────────────────────────────► agree
//!                            ▲   │ update naming {3, 5}                   │
//!                            └───┘ (widen, rebroadcast)                   ▼
//!                                                            replay deferred mail
//! ```
//!
//! While discovery runs the site defers everything except fault traffic and
//! poison, so the values it reports cannot move under it.

use lockstep_messages::{Envelope, FailureSiteUpdateMessage};
use lockstep_types::{PartitionId, SiteId, Topology, TxnId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// What every survivor computes once all reports are in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultAgreement {
    pub failed: BTreeSet<SiteId>,
    /// Newest multi-partition transaction any survivor saw commit.
    pub globally_committed: TxnId,
    /// Per dead initiator: the newest id every replica of this site's
    /// partition is known to hold.
    pub partition_safe: BTreeMap<SiteId, TxnId>,
    /// Per dead initiator: the newest id every replica of every surviving
    /// partition is known to hold. Bounds multi-partition work.
    pub cluster_safe: BTreeMap<SiteId, TxnId>,
}

/// An agreement round in progress.
#[derive(Debug)]
pub(crate) struct FaultDiscovery {
    failed: BTreeSet<SiteId>,
    reports: BTreeMap<SiteId, FailureSiteUpdateMessage>,
    deferred: VecDeque<Envelope>,
}

impl FaultDiscovery {
    pub(crate) fn new(failed: BTreeSet<SiteId>, deferred: VecDeque<Envelope>) -> Self {
        Self {
            failed,
            reports: BTreeMap::new(),
            deferred,
        }
    }

    pub(crate) fn failed(&self) -> &BTreeSet<SiteId> {
        &self.failed
    }

    /// Keep a survivor's report if it is about the current failed set.
    pub(crate) fn record(&mut self, update: FailureSiteUpdateMessage) -> bool {
        if update.failed_site_ids != self.failed {
            return false;
        }
        self.reports.insert(update.source_site_id, update);
        true
    }

    pub(crate) fn defer(&mut self, envelope: Envelope) {
        self.deferred.push_back(envelope);
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn into_deferred(self) -> VecDeque<Envelope> {
        self.deferred
    }

    /// Survivors that have not reported yet.
    pub(crate) fn missing<'a>(&'a self, survivors: &'a [SiteId]) -> impl Iterator<Item = SiteId> + 'a {
        survivors
            .iter()
            .copied()
            .filter(|site| !self.reports.contains_key(site))
    }

    pub(crate) fn is_complete(&self, survivors: &[SiteId]) -> bool {
        self.missing(survivors).next().is_none()
    }

    /// Combine every report. Deterministic in the set of reports.
    pub(crate) fn agree(&self, topology: &dyn Topology, partition: PartitionId) -> FaultAgreement {
        let globally_committed = self
            .reports
            .values()
            .map(|r| r.committed_mp_txn_id)
            .max()
            .unwrap_or(TxnId::NONE);

        // dead initiator -> partition -> max safe point reported by a replica
        let mut by_partition: BTreeMap<SiteId, BTreeMap<PartitionId, TxnId>> = BTreeMap::new();
        let reporting_partitions: BTreeSet<PartitionId> = self
            .reports
            .keys()
            .filter_map(|site| topology.partition_for_site(*site))
            .collect();
        for initiator in self.failed.iter().filter(|s| topology.is_initiator(**s)) {
            by_partition.insert(*initiator, BTreeMap::new());
        }
        for report in self.reports.values() {
            let Some(reporter_partition) = topology.partition_for_site(report.source_site_id) else {
                continue;
            };
            for (initiator, safe) in &report.initiator_safe_points {
                let points = by_partition.entry(*initiator).or_default();
                let slot = points.entry(reporter_partition).or_insert(TxnId::NONE);
                *slot = (*slot).max(*safe);
            }
        }

        let mut partition_safe = BTreeMap::new();
        let mut cluster_safe = BTreeMap::new();
        for (initiator, points) in by_partition {
            partition_safe.insert(
                initiator,
                points.get(&partition).copied().unwrap_or(TxnId::NONE),
            );
            let cluster = reporting_partitions
                .iter()
                .map(|p| points.get(p).copied().unwrap_or(TxnId::NONE))
                .min()
                .unwrap_or(TxnId::NONE);
            cluster_safe.insert(initiator, cluster);
        }

        FaultAgreement {
            failed: self.failed.clone(),
            globally_committed,
            partition_safe,
            cluster_safe,
        }
    }
}
