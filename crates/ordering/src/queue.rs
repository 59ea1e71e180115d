//! The restricted priority queue.

use crate::OrderingError;
use lockstep_messages::QueueState;
use lockstep_types::{SiteId, TxnId};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub txn_id: TxnId,
    pub initiator_id: SiteId,
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The transaction is now pending.
    Inserted,
    /// Already pending or already released; nothing changed.
    Duplicate,
    /// The initiator is dead; its late traffic is discarded.
    Retired,
}

/// What the queue knows about one live initiator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InitiatorPoint {
    /// Newest id seen from the initiator. By per-sender FIFO nothing lower
    /// can still arrive.
    last_seen: TxnId,
    /// Newest id the initiator reports every replica has received.
    safe: TxnId,
}

/// Releases pending transactions in global id order.
///
/// The head `T` is releasable only when `T` is at or below every live
/// initiator's `last_seen`. With replica safety on, `T` must also be at or
/// below the safe point of its own initiator, so no replica releases a
/// transaction another replica might never receive.
#[derive(Debug, Clone)]
pub struct RestrictedPriorityQueue {
    initiators: BTreeMap<SiteId, InitiatorPoint>,
    /// Dead initiators and the safe point survivors agreed on.
    retired: BTreeMap<SiteId, TxnId>,
    pending: BTreeMap<TxnId, SiteId>,
    last_released: TxnId,
    replica_safety: bool,
}

impl RestrictedPriorityQueue {
    /// Create a queue blocking on `initiators`.
    pub fn new(initiators: impl IntoIterator<Item = SiteId>, replica_safety: bool) -> Self {
        Self {
            initiators: initiators
                .into_iter()
                .map(|id| (id, InitiatorPoint::default()))
                .collect(),
            retired: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_released: TxnId::NONE,
            replica_safety,
        }
    }

    /// Enqueue a transaction.
    ///
    /// Also notes an advance of the initiator to `txn_id` and `safe_txn_id`.
    pub fn insert(
        &mut self,
        txn_id: TxnId,
        initiator_id: SiteId,
        safe_txn_id: TxnId,
    ) -> Result<InsertOutcome, OrderingError> {
        if self.retired.contains_key(&initiator_id) {
            return Ok(InsertOutcome::Retired);
        }
        let point = self
            .initiators
            .get(&initiator_id)
            .copied()
            .ok_or(OrderingError::UnknownInitiator(initiator_id))?;

        if txn_id <= self.last_released || self.pending.contains_key(&txn_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        if txn_id < point.last_seen {
            return Err(OrderingError::Regression {
                initiator: initiator_id,
                txn_id,
                last_seen: point.last_seen,
            });
        }
        if txn_id == point.last_seen {
            return Ok(InsertOutcome::Duplicate);
        }

        self.pending.insert(txn_id, initiator_id);
        self.note_advance(initiator_id, txn_id, safe_txn_id)?;
        Ok(InsertOutcome::Inserted)
    }

    /// Move an initiator's points forward. Backward moves are ignored.
    pub fn note_advance(
        &mut self,
        initiator_id: SiteId,
        txn_id: TxnId,
        safe_txn_id: TxnId,
    ) -> Result<(), OrderingError> {
        if self.retired.contains_key(&initiator_id) {
            return Ok(());
        }
        let point = self
            .initiators
            .get_mut(&initiator_id)
            .ok_or(OrderingError::UnknownInitiator(initiator_id))?;
        point.last_seen = point.last_seen.max(txn_id);
        point.safe = point.safe.max(safe_txn_id);
        Ok(())
    }

    /// Release the head if it is releasable.
    pub fn poll(&mut self) -> Option<QueueEntry> {
        if self.state() != QueueState::Unblocked {
            return None;
        }
        let (txn_id, initiator_id) = self.pending.pop_first()?;
        self.last_released = txn_id;
        Some(QueueEntry {
            txn_id,
            initiator_id,
        })
    }

    /// Smallest pending transaction, releasable or not.
    pub fn peek(&self) -> Option<QueueEntry> {
        self.pending
            .first_key_value()
            .map(|(txn_id, initiator_id)| QueueEntry {
                txn_id: *txn_id,
                initiator_id: *initiator_id,
            })
    }

    /// Why the head is or is not releasable.
    pub fn state(&self) -> QueueState {
        let Some(head) = self.peek() else {
            return QueueState::BlockedEmpty;
        };
        if head.txn_id > self.min_last_seen() {
            return QueueState::BlockedOrdering;
        }
        if self.replica_safety {
            if let Some(point) = self.initiators.get(&head.initiator_id) {
                if head.txn_id > point.safe {
                    return QueueState::BlockedSafety;
                }
            }
        }
        QueueState::Unblocked
    }

    /// Start blocking on an initiator that joined the cluster.
    ///
    /// Nothing is released past the newcomer until it vouches for an id.
    /// Known and retired initiators are left alone; returns whether the
    /// initiator was added.
    pub fn add_initiator(&mut self, initiator_id: SiteId) -> bool {
        if self.initiators.contains_key(&initiator_id) || self.retired.contains_key(&initiator_id) {
            return false;
        }
        self.initiators.insert(initiator_id, InitiatorPoint::default());
        info!(initiator = %initiator_id, "Initiator joined admission");
        true
    }

    /// Stop blocking on a dead initiator.
    ///
    /// `agreed_safe` is the safe point every survivor settled on. With
    /// replica safety on, pending items above it are discarded and returned:
    /// not every replica is guaranteed to hold them.
    pub fn remove_initiator(&mut self, initiator_id: SiteId, agreed_safe: TxnId) -> Vec<TxnId> {
        if self.initiators.remove(&initiator_id).is_none() {
            return Vec::new();
        }
        self.retired.insert(initiator_id, agreed_safe);

        let mut dropped = Vec::new();
        if self.replica_safety {
            self.pending.retain(|txn_id, owner| {
                let keep = *owner != initiator_id || *txn_id <= agreed_safe;
                if !keep {
                    dropped.push(*txn_id);
                }
                keep
            });
        }
        info!(
            initiator = %initiator_id,
            agreed_safe = %agreed_safe,
            dropped = dropped.len(),
            "Initiator retired from admission"
        );
        dropped
    }

    /// Remove a pending transaction without releasing it.
    pub fn remove(&mut self, txn_id: TxnId) -> bool {
        let removed = self.pending.remove(&txn_id).is_some();
        if removed {
            debug!(txn_id = %txn_id, "Pending transaction removed");
        }
        removed
    }

    /// Newest id seen from a live initiator.
    pub fn last_seen(&self, initiator_id: SiteId) -> Option<TxnId> {
        self.initiators.get(&initiator_id).map(|p| p.last_seen)
    }

    /// Replica-safe point recorded for an initiator, live or retired.
    pub fn safe_point(&self, initiator_id: SiteId) -> Option<TxnId> {
        self.initiators
            .get(&initiator_id)
            .map(|p| p.safe)
            .or_else(|| self.retired.get(&initiator_id).copied())
    }

    /// Whether an initiator still blocks admission.
    pub fn is_live_initiator(&self, initiator_id: SiteId) -> bool {
        self.initiators.contains_key(&initiator_id)
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.pending.contains_key(&txn_id)
    }

    pub fn last_released(&self) -> TxnId {
        self.last_released
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn min_last_seen(&self) -> TxnId {
        self.initiators
            .values()
            .map(|p| p.last_seen)
            .min()
            .unwrap_or(TxnId(u64::MAX))
    }
}
