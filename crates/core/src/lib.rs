//! Core seams for the Lockstep execution core.
//!
//! An execution site talks to the rest of the world through three traits:
//!
//! - [`Mailbox`]: addressable, per-sender FIFO message delivery. Production
//!   uses [`PostOffice`]/[`ChannelMailbox`]; the simulation crate plugs in a
//!   deterministic, fault-injecting implementation.
//! - [`FragmentEngine`]: executes plan fragments against the partition's data
//!   with per-transaction undo.
//! - [`Procedure`]/[`ProcedureRun`]: the procedure-runner layer, written in
//!   continuation style so a site can drive any number of batches without
//!   native recursion.
//!
//! ```text
//!   Initiator ──► Mailbox ──► ExecutionSite ──► ProcedureRun::resume ──► Batch
//!                                  │                                        │
//!                                  └──────── FragmentEngine ◄───────────────┘
//! ```

mod catalog;
mod engine;
mod mailbox;
mod post_office;
mod procedure;
pub mod sysproc;

pub use catalog::{CatalogError, ProcedureCatalog, ProcedureInfo, ProcedureKind};
pub use engine::{DependencyInputs, FragmentEngine, FragmentError, StateFingerprint};
pub use mailbox::Mailbox;
pub use post_office::{ChannelMailbox, MailboxError, PostOffice};
pub use procedure::{
    Batch, BatchResults, FragmentTarget, PlannedFragment, Procedure, ProcedureContext,
    ProcedureError, ProcedureRun, ProcedureStep,
};
