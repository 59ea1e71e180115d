//! Admission ordering for execution sites.
//!
//! Several initiators issue transaction ids independently. Each site holds
//! arriving work in a [`RestrictedPriorityQueue`] and releases the smallest
//! pending id only once every live initiator has vouched that nothing smaller
//! can still arrive. Because every replica applies the same rule to the same
//! per-initiator streams, every replica releases the same sequence.

mod error;
mod queue;

pub use error::OrderingError;
pub use lockstep_messages::QueueState;
pub use queue::{InsertOutcome, QueueEntry, RestrictedPriorityQueue};
