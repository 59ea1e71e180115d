//! Site errors.

use lockstep_ordering::OrderingError;
use lockstep_txn::TxnError;
use lockstep_types::{PartitionId, SiteId, TxnId};
use thiserror::Error;

/// Errors raised by an execution site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteError {
    /// The topology has no partition for this site.
    #[error("{0} is not an execution site")]
    NotAnExecutionSite(SiteId),

    /// A topology update moved this site to another partition.
    #[error("{site} moved from {from} to {to}")]
    PartitionReassigned {
        site: SiteId,
        from: PartitionId,
        to: PartitionId,
    },

    #[error(transparent)]
    Ordering(#[from] OrderingError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    /// A commit arrived out of transaction id order.
    #[error("commit of {txn_id} after {last_committed}")]
    OutOfOrderCommit {
        txn_id: TxnId,
        last_committed: TxnId,
    },

    /// No state for a transaction the site was asked to run.
    #[error("no state for {0}")]
    UnknownTransaction(TxnId),
}

impl SiteError {
    /// Whether the site must stop: replicas may no longer agree.
    pub fn is_fatal(&self) -> bool {
        match self {
            SiteError::Ordering(e) => e.is_fatal(),
            SiteError::Txn(e) => e.is_fatal(),
            SiteError::OutOfOrderCommit { .. } => true,
            SiteError::NotAnExecutionSite(_)
            | SiteError::PartitionReassigned { .. }
            | SiteError::UnknownTransaction(_) => false,
        }
    }
}
