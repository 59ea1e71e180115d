//! Transaction states owned by an execution site.
//!
//! # Roles
//!
//! - [`SinglePartitionTxnState`]: runs a whole procedure locally in one step.
//! - [`MultiPartitionParticipantTxnState`]: one site's share of a
//!   multi-partition transaction. The coordinating site drives the procedure
//!   and fans batches out; every other site executes the fragments it is sent
//!   and waits for the coordinator's commit or rollback.
//!
//! States never touch the mailbox or the commit bookkeeping directly. Each
//! step runs against an [`ExecutionContext`] that lends the engine and
//! collects outgoing messages, and returns a [`StepOutcome`] telling the site
//! whether the transaction is blocked or which way it finished.

mod common;
mod context;
mod error;
mod multi;
mod orphan;
mod single;
mod state;
mod tracker;

pub use common::{Decision, StepOutcome, TxnCommon, TxnPhase};
pub use context::{ExecutionContext, Outbox, Outgoing};
pub use error::TxnError;
pub use multi::{FaultImpact, MultiPartitionParticipantTxnState};
pub use orphan::decide_orphan_outcome;
pub use single::SinglePartitionTxnState;
pub use state::TransactionState;
pub use tracker::DependencyTracker;
