//! Transaction initiation messages.

use lockstep_types::{ClientResponse, PartitionId, SiteId, StoredProcedureInvocation, TxnId};
use serde::{Deserialize, Serialize};

/// Starts a transaction at a site.
///
/// Single-partition transactions are sent to every replica of the target
/// partition. Multi-partition transactions are sent to the coordinator only;
/// the remaining participants receive a [`MultiPartitionParticipantMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateTaskMessage {
    /// Initiator that assigned the transaction id.
    pub initiator_id: SiteId,
    /// Coordinating site (the receiving site for single-partition work).
    pub coordinator_site_id: SiteId,
    /// Transaction id.
    pub txn_id: TxnId,
    /// Whether the procedure only reads.
    pub read_only: bool,
    /// Whether the procedure touches a single partition.
    pub single_partition: bool,
    /// Procedure invocation.
    pub invocation: StoredProcedureInvocation,
    /// Highest id the initiator knows every replica of this partition has received.
    pub safe_txn_id: TxnId,
    /// Non-coordinating participants of a multi-partition transaction.
    pub participant_site_ids: Vec<SiteId>,
}

impl InitiateTaskMessage {
    /// Create a single-partition initiation.
    pub fn single_partition(
        initiator_id: SiteId,
        site: SiteId,
        txn_id: TxnId,
        read_only: bool,
        invocation: StoredProcedureInvocation,
        safe_txn_id: TxnId,
    ) -> Self {
        Self {
            initiator_id,
            coordinator_site_id: site,
            txn_id,
            read_only,
            single_partition: true,
            invocation,
            safe_txn_id,
            participant_site_ids: Vec::new(),
        }
    }

    /// Create a multi-partition initiation for the coordinator.
    pub fn multi_partition(
        initiator_id: SiteId,
        coordinator_site_id: SiteId,
        txn_id: TxnId,
        read_only: bool,
        invocation: StoredProcedureInvocation,
        safe_txn_id: TxnId,
        participant_site_ids: Vec<SiteId>,
    ) -> Self {
        Self {
            initiator_id,
            coordinator_site_id,
            txn_id,
            read_only,
            single_partition: false,
            invocation,
            safe_txn_id,
            participant_site_ids,
        }
    }

    /// Derive the notice sent to a non-coordinating participant.
    pub fn participant_notice(&self, safe_txn_id: TxnId) -> MultiPartitionParticipantMessage {
        MultiPartitionParticipantMessage {
            initiator_id: self.initiator_id,
            coordinator_site_id: self.coordinator_site_id,
            txn_id: self.txn_id,
            read_only: self.read_only,
            safe_txn_id,
        }
    }
}

/// Tells a non-coordinating participant a multi-partition transaction exists,
/// so it can reserve the transaction's slot in its admission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPartitionParticipantMessage {
    /// Initiator that assigned the transaction id.
    pub initiator_id: SiteId,
    /// Coordinating site.
    pub coordinator_site_id: SiteId,
    /// Transaction id.
    pub txn_id: TxnId,
    /// Whether the procedure only reads.
    pub read_only: bool,
    /// Highest id the initiator knows every replica of this partition has received.
    pub safe_txn_id: TxnId,
}

/// Result of a finished transaction, sent back to its initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponseMessage {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Initiator the response is addressed to.
    pub initiator_id: SiteId,
    /// Responding site.
    pub site_id: SiteId,
    /// Partition of the responding site.
    pub partition_id: PartitionId,
    /// Client handle copied from the invocation.
    pub client_handle: u64,
    /// Response payload.
    pub response: ClientResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::test_utils::invocation;

    #[test]
    fn test_participant_notice_copies_identity() {
        let task = InitiateTaskMessage::multi_partition(
            SiteId(9),
            SiteId(1),
            TxnId(1000),
            true,
            invocation("Sum", &[]),
            TxnId(900),
            vec![SiteId(2), SiteId(3)],
        );
        let notice = task.participant_notice(TxnId(950));
        assert_eq!(notice.initiator_id, SiteId(9));
        assert_eq!(notice.coordinator_site_id, SiteId(1));
        assert_eq!(notice.txn_id, TxnId(1000));
        assert!(notice.read_only);
        assert_eq!(notice.safe_txn_id, TxnId(950));
    }

    #[test]
    fn test_single_partition_has_no_participants() {
        let task = InitiateTaskMessage::single_partition(
            SiteId(9),
            SiteId(1),
            TxnId(1000),
            false,
            invocation("Inc", &[1]),
            TxnId::NONE,
        );
        assert!(task.single_partition);
        assert!(task.participant_site_ids.is_empty());
        assert_eq!(task.coordinator_site_id, SiteId(1));
    }
}
