//! Simulation errors.

use lockstep_site::SiteError;
use lockstep_types::{PartitionId, SiteId, TopologyError, TxnIdError};
use thiserror::Error;

/// Errors raised while setting up or driving a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    TxnId(#[from] TxnIdError),

    #[error("site error: {0}")]
    Site(#[from] SiteError),

    #[error("{0} is not an initiator")]
    UnknownInitiator(SiteId),

    #[error("initiator {0} is dead")]
    DeadInitiator(SiteId),

    #[error("no live replica of {0}")]
    NoLiveReplica(PartitionId),

    #[error("no live execution site")]
    NoLiveSites,

    /// Replicas of one partition disagree. Always a bug.
    #[error("replicas of {partition} diverged: {detail}")]
    ReplicaDivergence {
        partition: PartitionId,
        detail: String,
    },
}
