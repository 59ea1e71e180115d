//! The message union delivered through site mailboxes.

use crate::{
    CompleteTransactionMessage, FailureSiteUpdateMessage, FragmentResponseMessage,
    FragmentTaskMessage, HeartbeatMessage, HeartbeatResponseMessage, InitiateResponseMessage,
    InitiateTaskMessage, MultiPartitionParticipantMessage, SiteFailureFault,
};
use lockstep_types::{SiteId, TxnId};
use serde::{Deserialize, Serialize};

/// Every message a site or initiator can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteMessage {
    // ═══════════════════════════════════════════════════════════════════════
    // Initiation
    // ═══════════════════════════════════════════════════════════════════════
    /// Start a transaction (single-partition, or multi-partition coordinator).
    InitiateTask(InitiateTaskMessage),

    /// Reserve a multi-partition transaction at a non-coordinating participant.
    MultiPartitionParticipant(MultiPartitionParticipantMessage),

    /// Transaction result for the initiator.
    InitiateResponse(InitiateResponseMessage),

    /// Safe point advance without a transaction.
    Heartbeat(HeartbeatMessage),

    /// Heartbeat acknowledgement for the initiator.
    HeartbeatResponse(HeartbeatResponseMessage),

    // ═══════════════════════════════════════════════════════════════════════
    // Multi-partition execution
    // ═══════════════════════════════════════════════════════════════════════
    /// Fragment to execute.
    FragmentTask(FragmentTaskMessage),

    /// Fragment result for the coordinator.
    FragmentResponse(FragmentResponseMessage),

    /// Commit or roll back a multi-partition transaction.
    CompleteTransaction(CompleteTransactionMessage),

    // ═══════════════════════════════════════════════════════════════════════
    // Faults and administration
    // ═══════════════════════════════════════════════════════════════════════
    /// Sites confirmed dead.
    SiteFailure(SiteFailureFault),

    /// Survivor agreement exchange.
    FailureSiteUpdate(FailureSiteUpdateMessage),

    /// Shut the site down.
    Poison {
        /// Why the site is being stopped.
        reason: String,
    },
}

/// Coarse message class used for subject-filtered receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    /// Initiations, participant notices and heartbeats.
    Initiation,
    /// Responses addressed to initiators.
    Response,
    /// Fragment tasks, fragment responses and completions.
    Execution,
    /// Fault notices and agreement updates.
    Fault,
    /// Poison.
    Admin,
}

impl SiteMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            SiteMessage::InitiateTask(_) => "InitiateTask",
            SiteMessage::MultiPartitionParticipant(_) => "MultiPartitionParticipant",
            SiteMessage::InitiateResponse(_) => "InitiateResponse",
            SiteMessage::Heartbeat(_) => "Heartbeat",
            SiteMessage::HeartbeatResponse(_) => "HeartbeatResponse",
            SiteMessage::FragmentTask(_) => "FragmentTask",
            SiteMessage::FragmentResponse(_) => "FragmentResponse",
            SiteMessage::CompleteTransaction(_) => "CompleteTransaction",
            SiteMessage::SiteFailure(_) => "SiteFailure",
            SiteMessage::FailureSiteUpdate(_) => "FailureSiteUpdate",
            SiteMessage::Poison { .. } => "Poison",
        }
    }

    /// Subject used for filtered receive.
    pub fn subject(&self) -> Subject {
        match self {
            SiteMessage::InitiateTask(_)
            | SiteMessage::MultiPartitionParticipant(_)
            | SiteMessage::Heartbeat(_) => Subject::Initiation,
            SiteMessage::InitiateResponse(_) | SiteMessage::HeartbeatResponse(_) => {
                Subject::Response
            }
            SiteMessage::FragmentTask(_)
            | SiteMessage::FragmentResponse(_)
            | SiteMessage::CompleteTransaction(_) => Subject::Execution,
            SiteMessage::SiteFailure(_) | SiteMessage::FailureSiteUpdate(_) => Subject::Fault,
            SiteMessage::Poison { .. } => Subject::Admin,
        }
    }

    /// Transaction this message concerns, if any.
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            SiteMessage::InitiateTask(m) => Some(m.txn_id),
            SiteMessage::MultiPartitionParticipant(m) => Some(m.txn_id),
            SiteMessage::InitiateResponse(m) => Some(m.txn_id),
            SiteMessage::Heartbeat(m) => Some(m.txn_id),
            SiteMessage::FragmentTask(m) => Some(m.txn_id),
            SiteMessage::FragmentResponse(m) => Some(m.txn_id),
            SiteMessage::CompleteTransaction(m) => Some(m.txn_id),
            SiteMessage::HeartbeatResponse(_)
            | SiteMessage::SiteFailure(_)
            | SiteMessage::FailureSiteUpdate(_)
            | SiteMessage::Poison { .. } => None,
        }
    }

    /// Check if this is fault traffic, which is never deferred.
    pub fn is_fault(&self) -> bool {
        self.subject() == Subject::Fault
    }
}

/// A message together with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending site.
    pub source: SiteId,
    /// Payload.
    pub message: SiteMessage,
}

impl Envelope {
    /// Wrap a message.
    pub fn new(source: SiteId, message: SiteMessage) -> Self {
        Self { source, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::TxnId;

    #[test]
    fn test_subjects() {
        let hb = SiteMessage::Heartbeat(HeartbeatMessage {
            initiator_id: SiteId(5),
            txn_id: TxnId(10),
            safe_txn_id: TxnId(8),
        });
        assert_eq!(hb.subject(), Subject::Initiation);
        assert_eq!(hb.txn_id(), Some(TxnId(10)));
        assert_eq!(hb.type_name(), "Heartbeat");

        let fault = SiteMessage::SiteFailure(SiteFailureFault::new([SiteId(1)]));
        assert!(fault.is_fault());
        assert_eq!(fault.txn_id(), None);

        let poison = SiteMessage::Poison {
            reason: "test".into(),
        };
        assert_eq!(poison.subject(), Subject::Admin);
    }
}
