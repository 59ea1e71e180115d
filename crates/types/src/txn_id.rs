//! Transaction identifiers and their generator.
//!
//! # Layout
//!
//! ```text
//!  63   62                        23 22          10 9            0
//! ┌───┬────────────────────────────┬──────────────┬──────────────┐
//! │ 0 │ timestamp (ms, 40 bits)    │ counter (13) │ initiator(10)│
//! └───┴────────────────────────────┴──────────────┴──────────────┘
//! ```
//!
//! Ids from one initiator are strictly increasing; embedding the initiator id
//! in the low bits makes ids from different initiators globally unique, so
//! comparing two ids never ties.

use crate::SiteId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const TIMESTAMP_BITS: u32 = 40;
const COUNTER_BITS: u32 = 13;
const INITIATOR_BITS: u32 = 10;

const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Largest initiator id that fits in a transaction id.
pub const MAX_INITIATOR_ID: u64 = (1 << INITIATOR_BITS) - 1;

/// Globally unique, time-ordered transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// "No transaction yet". Every issued id is greater.
    pub const NONE: Self = TxnId(0);

    /// Build an id from its parts.
    pub fn compose(timestamp_ms: u64, counter: u64, initiator: u64) -> Self {
        debug_assert!(timestamp_ms <= MAX_TIMESTAMP);
        debug_assert!(counter <= MAX_COUNTER);
        debug_assert!(initiator <= MAX_INITIATOR_ID);
        TxnId(
            (timestamp_ms << (COUNTER_BITS + INITIATOR_BITS))
                | (counter << INITIATOR_BITS)
                | initiator,
        )
    }

    /// Milliseconds since the generator's epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> (COUNTER_BITS + INITIATOR_BITS)
    }

    /// Per-millisecond sequence number.
    pub fn counter(&self) -> u64 {
        (self.0 >> INITIATOR_BITS) & MAX_COUNTER
    }

    /// Id of the initiator that issued this transaction id.
    pub fn initiator_bits(&self) -> u64 {
        self.0 & MAX_INITIATOR_ID
    }

    /// Whether this is [`TxnId::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn({})", self.0)
    }
}

/// Errors creating a transaction id generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnIdError {
    /// Initiator id is zero or does not fit in the id layout.
    #[error("initiator {0} cannot issue transaction ids (valid range 1..={MAX_INITIATOR_ID})")]
    InitiatorOutOfRange(SiteId),
}

/// Issues strictly increasing transaction ids for one initiator.
///
/// The clock is supplied by the caller (`now` is time since the cluster
/// epoch), which keeps id assignment deterministic under simulation. A clock
/// that stalls or moves backwards keeps counting within the last
/// millisecond; counter overflow borrows the next millisecond.
#[derive(Debug, Clone)]
pub struct TxnIdGenerator {
    initiator: u64,
    last_timestamp: u64,
    counter: u64,
    last_issued: TxnId,
}

impl TxnIdGenerator {
    /// Create a generator for an initiator.
    pub fn new(initiator: SiteId) -> Result<Self, TxnIdError> {
        if initiator.0 == 0 || initiator.0 > MAX_INITIATOR_ID {
            return Err(TxnIdError::InitiatorOutOfRange(initiator));
        }
        Ok(Self {
            initiator: initiator.0,
            last_timestamp: 0,
            counter: 0,
            last_issued: TxnId::NONE,
        })
    }

    /// Issue the next id.
    pub fn next(&mut self, now: Duration) -> TxnId {
        let now_ms = (now.as_millis() as u64).min(MAX_TIMESTAMP);

        if now_ms > self.last_timestamp {
            self.last_timestamp = now_ms;
            self.counter = 0;
        } else if self.counter >= MAX_COUNTER {
            self.last_timestamp += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        let id = TxnId::compose(self.last_timestamp, self.counter, self.initiator);
        debug_assert!(id > self.last_issued, "transaction ids must increase");
        self.last_issued = id;
        id
    }

    /// The most recently issued id, or [`TxnId::NONE`].
    pub fn last_issued(&self) -> TxnId {
        self.last_issued
    }
}
