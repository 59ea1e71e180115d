//! State shared by every transaction role.

use lockstep_types::{SiteId, TxnId};

/// Lifecycle of a transaction on one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnPhase {
    /// Known to the site, not yet released for execution.
    Created,
    /// Released and executing.
    Running,
    /// Multi-partition work is waiting on another site.
    BlockedOnDependency,
    Committed,
    RolledBack,
}

/// Final decision for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Commit,
    Rollback,
}

/// Result of driving a transaction one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Waiting for messages from other sites.
    Blocked,
    /// Done; the site applies the decision to the engine.
    Finished(Decision),
}

/// Fields every transaction state carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnCommon {
    pub txn_id: TxnId,
    pub initiator_id: SiteId,
    pub coordinator_site_id: SiteId,
    pub read_only: bool,
    pub single_partition: bool,
    pub done: bool,
    pub needs_rollback: bool,
    pub phase: TxnPhase,
}

impl TxnCommon {
    pub fn new(
        txn_id: TxnId,
        initiator_id: SiteId,
        coordinator_site_id: SiteId,
        read_only: bool,
        single_partition: bool,
    ) -> Self {
        Self {
            txn_id,
            initiator_id,
            coordinator_site_id,
            read_only,
            single_partition,
            done: false,
            needs_rollback: false,
            phase: TxnPhase::Created,
        }
    }

    /// Record the final decision and return it as a step outcome.
    pub(crate) fn finish(&mut self, decision: Decision) -> StepOutcome {
        self.done = true;
        self.needs_rollback = decision == Decision::Rollback;
        self.phase = match decision {
            Decision::Commit => TxnPhase::Committed,
            Decision::Rollback => TxnPhase::RolledBack,
        };
        StepOutcome::Finished(decision)
    }
}
