//! Lockstep Simulator
//!
//! Runs seeded workloads against a simulated cluster and reports what
//! happened.
//!
//! # Architecture
//!
//! The simulator builds on `lockstep-simulation` to provide:
//!
//! - **Configuration**: one TOML-loadable struct covering network, sites,
//!   initiators, workload and a kill schedule
//! - **Metrics Collection**: outcome counts and latency percentiles
//! - **Consistency Report**: per-partition commit counts and state
//!   fingerprints of every surviving replica
//!
//! # Example
//!
//! ```ignore
//! use lockstep_simulator::{Simulator, SimulatorConfig};
//! use std::time::Duration;
//!
//! // 2 partitions, 3 replicas each, one site killed mid-run
//! let config = SimulatorConfig::new(2, 3)
//!     .with_duration(Duration::from_secs(5))
//!     .with_kill(Duration::from_secs(2), SiteId(1));
//!
//! let report = Simulator::new(config)?.run()?;
//! report.print();
//! assert!(report.is_consistent());
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod runner;

pub use config::{ScheduledKill, SimulatorConfig};
pub use error::SimulatorError;
pub use metrics::{LatencySummary, MetricsCollector, PartitionReport, SimulationReport};
pub use runner::Simulator;
