//! Ordering errors.

use lockstep_types::{SiteId, TxnId};
use thiserror::Error;

/// Errors raised by the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingError {
    /// A new id arrived below a point the initiator had already vouched for.
    #[error("initiator {initiator} sent {txn_id} after vouching for {last_seen}")]
    Regression {
        initiator: SiteId,
        txn_id: TxnId,
        last_seen: TxnId,
    },

    /// The sender is not a configured initiator.
    #[error("{0} is not a known initiator")]
    UnknownInitiator(SiteId),
}

impl OrderingError {
    /// Whether the site can no longer guarantee replica order.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrderingError::Regression { .. })
    }
}
