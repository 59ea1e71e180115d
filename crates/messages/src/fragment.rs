//! Multi-partition fragment fan-out and completion messages.

use lockstep_types::{
    DependencyId, FragmentId, Parameters, PartitionId, SiteId, Table, TxnId,
};
use serde::{Deserialize, Serialize};

/// One unit of plan execution for a multi-partition transaction.
///
/// Sent by the coordinator to each non-coordinating participant; the
/// coordinator also queues a local copy for its own work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentTaskMessage {
    /// Initiator of the transaction.
    pub initiator_id: SiteId,
    /// Coordinating site.
    pub coordinator_site_id: SiteId,
    /// Transaction id.
    pub txn_id: TxnId,
    /// Per-task id, unique within the transaction.
    pub unique_id: u64,
    /// Whether the transaction only reads.
    pub read_only: bool,
    /// Plan fragment to execute.
    pub fragment_id: FragmentId,
    /// Dependency the output is published under.
    pub output_dep_id: DependencyId,
    /// Dependencies that must be available before execution.
    pub input_dep_ids: Vec<DependencyId>,
    /// Fragment parameters.
    pub parameters: Parameters,
    /// Whether this belongs to the procedure's last batch.
    pub is_final_task: bool,
}

/// Outcome of executing a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentStatus {
    /// Fragment ran; results are attached.
    Success,
    /// Fragment raised an application-level error (constraint, SQL error).
    UserError(String),
    /// Fragment could not run (unknown fragment, missing inputs).
    UnexpectedError(String),
}

impl FragmentStatus {
    /// Whether the fragment succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, FragmentStatus::Success)
    }
}

/// Result of a fragment, sent from the executing site to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentResponseMessage {
    /// Executing site.
    pub executor_site_id: SiteId,
    /// Partition of the executing site.
    pub partition_id: PartitionId,
    /// Transaction id.
    pub txn_id: TxnId,
    /// Task this answers.
    pub unique_id: u64,
    /// Execution status.
    pub status: FragmentStatus,
    /// Output tables keyed by dependency.
    pub dependencies: Vec<(DependencyId, Table)>,
}

impl FragmentResponseMessage {
    /// Create a successful response.
    pub fn success(
        executor_site_id: SiteId,
        partition_id: PartitionId,
        txn_id: TxnId,
        unique_id: u64,
        dependencies: Vec<(DependencyId, Table)>,
    ) -> Self {
        Self {
            executor_site_id,
            partition_id,
            txn_id,
            unique_id,
            status: FragmentStatus::Success,
            dependencies,
        }
    }

    /// Create a failed response.
    pub fn failure(
        executor_site_id: SiteId,
        partition_id: PartitionId,
        txn_id: TxnId,
        unique_id: u64,
        status: FragmentStatus,
    ) -> Self {
        Self {
            executor_site_id,
            partition_id,
            txn_id,
            unique_id,
            status,
            dependencies: Vec::new(),
        }
    }
}

/// Final decision for a multi-partition transaction.
///
/// Only sent once every participant has answered every batch, so a
/// participant receiving a commit has all of the transaction's work applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTransactionMessage {
    /// Initiator of the transaction.
    pub initiator_id: SiteId,
    /// Coordinating site.
    pub coordinator_site_id: SiteId,
    /// Transaction id.
    pub txn_id: TxnId,
    /// Roll back instead of committing.
    pub rollback: bool,
}
