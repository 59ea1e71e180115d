//! Deterministic simulation runner.
//!
//! This crate provides a fully deterministic simulation environment for
//! testing execution sites. Given the same seed, it produces identical results
//! every run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, Event>)        │ │
//! │  │     Ordered by: time, priority, node, sequence     │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  sites: ExecutionSite<SimMailbox>                  │ │
//! │  │  initiators: SimInitiator                          │ │
//! │  │  Each handles its deliveries sequentially          │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  Outgoing mail → SimulatedNetwork → new events     │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The network adds seeded latency and jitter while keeping each link FIFO,
//! so messages from different senders interleave differently per seed but a
//! single sender's stream never reorders. Killed sites stop sending and
//! receiving; survivors hear about it from a simulated fault detector after a
//! configurable delay.

mod error;
mod event_queue;
mod initiator;
mod mailbox;
mod network;
mod runner;
mod workload;

pub use error::SimulationError;
pub use event_queue::{Event, EventKey, EventPriority, EventQueue};
pub use initiator::{ClientOutcome, InitiatorConfig, SimInitiator};
pub use mailbox::SimMailbox;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats, FAULT_DETECTOR};
pub use workload::{CounterWorkload, Request, RequestKind, WorkloadConfig, WorkloadGenerator};
