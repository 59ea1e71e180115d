//! Transaction errors.

use lockstep_types::{DependencyId, PartitionId, TxnId};
use thiserror::Error;

/// Errors a transaction step cannot turn into a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    /// Two replicas of one partition returned different results.
    #[error("{txn_id}: replicas of {partition} disagree on {dep}")]
    ReplicaDivergence {
        txn_id: TxnId,
        dep: DependencyId,
        partition: PartitionId,
    },

    /// A message arrived that this role never receives.
    #[error("{txn_id}: unexpected {message} for this role")]
    UnexpectedMessage {
        txn_id: TxnId,
        message: &'static str,
    },
}

impl TxnError {
    /// Whether replicas can no longer be trusted to agree.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TxnError::ReplicaDivergence { .. })
    }
}
