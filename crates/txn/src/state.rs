//! The per-site transaction map entry.

use crate::{MultiPartitionParticipantTxnState, SinglePartitionTxnState, TxnCommon};
use lockstep_types::{SiteId, TxnId};

/// Any transaction a site is tracking.
#[derive(Debug)]
pub enum TransactionState {
    SinglePartition(SinglePartitionTxnState),
    MultiPartition(MultiPartitionParticipantTxnState),
}

impl TransactionState {
    pub fn common(&self) -> &TxnCommon {
        match self {
            TransactionState::SinglePartition(s) => s.common(),
            TransactionState::MultiPartition(m) => m.common(),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.common().txn_id
    }

    pub fn initiator_id(&self) -> SiteId {
        self.common().initiator_id
    }

    pub fn is_single_partition(&self) -> bool {
        matches!(self, TransactionState::SinglePartition(_))
    }

    /// Whether the transaction has been placed in the admission queue.
    ///
    /// Only a participant created from an early fragment can be waiting.
    pub fn is_admitted(&self) -> bool {
        match self {
            TransactionState::SinglePartition(_) => true,
            TransactionState::MultiPartition(m) => m.is_admitted(),
        }
    }

    pub fn as_multi_partition_mut(&mut self) -> Option<&mut MultiPartitionParticipantTxnState> {
        match self {
            TransactionState::MultiPartition(m) => Some(m),
            TransactionState::SinglePartition(_) => None,
        }
    }
}

impl From<SinglePartitionTxnState> for TransactionState {
    fn from(state: SinglePartitionTxnState) -> Self {
        TransactionState::SinglePartition(state)
    }
}

impl From<MultiPartitionParticipantTxnState> for TransactionState {
    fn from(state: MultiPartitionParticipantTxnState) -> Self {
        TransactionState::MultiPartition(state)
    }
}
