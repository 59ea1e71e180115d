//! Heartbeats that advance admission safe points without real transactions.

use lockstep_types::{SiteId, TxnId};
use serde::{Deserialize, Serialize};

/// Initiator heartbeat.
///
/// `txn_id` is a freshly issued id: by per-sender FIFO the initiator promises
/// nothing lower will follow. `safe_txn_id` is the highest id the initiator
/// knows every replica of the destination's partition has received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Sending initiator.
    pub initiator_id: SiteId,
    /// Freshly issued id.
    pub txn_id: TxnId,
    /// Replica-safe point for the destination's partition.
    pub safe_txn_id: TxnId,
}

/// Site's acknowledgement of a heartbeat.
///
/// Initiators fold these into the per-partition safe points they advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponseMessage {
    /// Responding site.
    pub site_id: SiteId,
    /// Initiator being acknowledged.
    pub initiator_id: SiteId,
    /// Newest id the site has received from that initiator.
    pub last_received_txn_id: TxnId,
    /// State of the site's admission queue when the heartbeat was handled.
    pub queue_state: QueueState,
}

/// Why an admission queue is or is not releasing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueState {
    /// The head item is releasable.
    Unblocked,
    /// Nothing is pending.
    BlockedEmpty,
    /// Some initiator has not yet vouched for the head item.
    BlockedOrdering,
    /// The head item is not yet known to be on every replica.
    BlockedSafety,
}
