//! Cluster fault notices and the survivor agreement exchange.

use lockstep_types::{SiteId, TxnId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Fault notice: the listed sites are dead.
///
/// Delivered to every execution site by the failure detector. Repeated or
/// incremental notices are expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailureFault {
    /// Sites confirmed dead.
    pub failed_site_ids: BTreeSet<SiteId>,
}

impl SiteFailureFault {
    /// Create a notice for the given sites.
    pub fn new(failed: impl IntoIterator<Item = SiteId>) -> Self {
        Self {
            failed_site_ids: failed.into_iter().collect(),
        }
    }
}

/// What one survivor knows at the time of a fault.
///
/// Every survivor broadcasts one of these per failed set it learns of; once a
/// site holds an update for its current failed set from every other survivor
/// all survivors compute the same global view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSiteUpdateMessage {
    /// Reporting site.
    pub source_site_id: SiteId,
    /// Every site the reporter knows is dead.
    pub failed_site_ids: BTreeSet<SiteId>,
    /// Reporter's last known globally committed multi-partition transaction.
    pub committed_mp_txn_id: TxnId,
    /// Reporter's recorded safe point for each dead initiator.
    pub initiator_safe_points: BTreeMap<SiteId, TxnId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_dedups_ids() {
        let fault = SiteFailureFault::new([SiteId(3), SiteId(1), SiteId(3)]);
        assert_eq!(
            fault.failed_site_ids.into_iter().collect::<Vec<_>>(),
            vec![SiteId(1), SiteId(3)]
        );
    }
}
