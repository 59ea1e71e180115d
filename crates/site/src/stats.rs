//! Site counters.

use serde::{Deserialize, Serialize};

/// Running totals for one site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub committed: u64,
    pub rolled_back: u64,
    /// Orphaned participants committed by the coordinator-failure rule.
    pub orphans_committed: u64,
    /// Orphaned participants rolled back by the coordinator-failure rule.
    pub orphans_rolled_back: u64,
    pub messages_handled: u64,
    /// Messages dropped as stale or from dead sites.
    pub messages_dropped: u64,
    pub fragments_executed: u64,
    /// Completed fault agreements.
    pub fault_agreements: u64,
}
