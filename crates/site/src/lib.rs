//! Execution sites.
//!
//! An [`ExecutionSite`] owns one replica of one partition. It is driven by a
//! single thread and only ever talks to the rest of the cluster through its
//! [`Mailbox`](lockstep_core::Mailbox):
//!
//! ```text
//!  mailbox ──► handle_message ──► admission queue ──► pump ──► recursable_run
//!     ▲                                                            │
//!     └────────────────────────── outbox flush ◄───────────────────┘
//! ```
//!
//! # Determinism
//!
//! Replicas of a partition release transactions in the same order and make
//! the same commit decisions, so their committed state never diverges. A
//! commit whose id is not above the last committed id is fatal.
//!
//! # Faults
//!
//! When sites die the survivors pause ordinary work, exchange what they know
//! and apply the same agreement: dead initiators stop blocking admission,
//! orphaned participants are committed or rolled back from the newest known
//! multi-partition commit, and coordinators stop waiting on dead
//! participants. See [`FaultAgreement`].

mod config;
mod error;
mod fault;
pub mod runtime;
mod site;
mod stats;

pub use config::SiteConfig;
pub use error::SiteError;
pub use fault::FaultAgreement;
pub use runtime::{spawn_site, SiteHandle};
pub use site::ExecutionSite;
pub use stats::SiteStats;
