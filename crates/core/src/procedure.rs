//! Procedure runner layer.
//!
//! A procedure is planned as a sequence of batches. Each call to
//! [`ProcedureRun::resume`] receives the previous batch's results and returns
//! either the next batch or the final client results. The execution site
//! drives this continuation in a bounded loop, so a procedure can chain many
//! batches without growing the native stack.

use crate::FragmentError;
use lockstep_types::{
    DependencyId, FragmentId, Parameters, PartitionId, ResponseStatus, SiteId, Table, TxnId,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Errors surfaced by a running procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureError {
    /// The procedure chose to abort.
    #[error("user abort: {0}")]
    UserAbort(String),

    /// The invocation parameters were unusable.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The procedure produced a malformed batch.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A fragment failed.
    #[error("fragment failed: {0}")]
    Fragment(#[from] FragmentError),

    /// A fragment failed on another site.
    #[error("fragment failed on {site}: {reason}")]
    Remote {
        /// Site that reported the failure.
        site: SiteId,
        /// Reported reason.
        reason: String,
    },

    /// The procedure chained more batches than the site allows.
    #[error("procedure exceeded {limit} batches")]
    BatchLimitExceeded {
        /// Configured limit.
        limit: usize,
    },

    /// No procedure registered under this name.
    #[error("unknown procedure {0}")]
    UnknownProcedure(String),
}

impl ProcedureError {
    /// Client-visible status for this failure.
    pub fn response_status(&self) -> ResponseStatus {
        match self {
            ProcedureError::UserAbort(_) => ResponseStatus::UserAbort,
            ProcedureError::Fragment(e) if e.is_user_error() => ResponseStatus::UserAbort,
            _ => ResponseStatus::GracefulFailure,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Batches
// ═══════════════════════════════════════════════════════════════════════════

/// Where a planned fragment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentTarget {
    /// Every participating site, one result per partition.
    AllSites,
    /// The executing (coordinator) site only.
    Coordinator,
}

/// One fragment of a batch.
///
/// Dependency ids are local to the batch; the transaction state renumbers
/// them before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFragment {
    pub fragment_id: FragmentId,
    pub params: Parameters,
    pub output_dep: DependencyId,
    pub input_deps: Vec<DependencyId>,
    pub target: FragmentTarget,
}

impl PlannedFragment {
    /// Fragment fanned out to every participating site.
    pub fn all_sites(fragment_id: FragmentId, params: Parameters, output_dep: DependencyId) -> Self {
        Self {
            fragment_id,
            params,
            output_dep,
            input_deps: Vec::new(),
            target: FragmentTarget::AllSites,
        }
    }

    /// Fragment run at the coordinator once its inputs are available.
    pub fn coordinator(
        fragment_id: FragmentId,
        params: Parameters,
        output_dep: DependencyId,
        input_deps: Vec<DependencyId>,
    ) -> Self {
        Self {
            fragment_id,
            params,
            output_dep,
            input_deps,
            target: FragmentTarget::Coordinator,
        }
    }
}

/// A set of fragments issued together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub fragments: Vec<PlannedFragment>,
    /// No further batch may follow.
    pub is_final: bool,
}

impl Batch {
    pub fn new(fragments: Vec<PlannedFragment>) -> Self {
        Self {
            fragments,
            is_final: false,
        }
    }

    pub fn final_batch(fragments: Vec<PlannedFragment>) -> Self {
        Self {
            fragments,
            is_final: true,
        }
    }

    /// Check the batch is well formed.
    ///
    /// Output dependencies are unique. All-sites fragments take no inputs.
    /// Coordinator fragments may only read outputs produced earlier in the
    /// same batch.
    pub fn validate(&self) -> Result<(), ProcedureError> {
        if self.fragments.is_empty() {
            return Err(ProcedureError::InvalidBatch("empty batch".into()));
        }
        let mut produced = BTreeSet::new();
        for fragment in &self.fragments {
            match fragment.target {
                FragmentTarget::AllSites if !fragment.input_deps.is_empty() => {
                    return Err(ProcedureError::InvalidBatch(format!(
                        "all-sites fragment {} declares inputs",
                        fragment.fragment_id
                    )));
                }
                _ => {}
            }
            for input in &fragment.input_deps {
                if !produced.contains(input) {
                    return Err(ProcedureError::InvalidBatch(format!(
                        "fragment {} reads {} before it is produced",
                        fragment.fragment_id, input
                    )));
                }
            }
            if !produced.insert(fragment.output_dep) {
                return Err(ProcedureError::InvalidBatch(format!(
                    "{} produced twice",
                    fragment.output_dep
                )));
            }
        }
        Ok(())
    }

    /// Whether any fragment must run on other sites.
    pub fn has_remote_work(&self) -> bool {
        self.fragments
            .iter()
            .any(|f| f.target == FragmentTarget::AllSites)
    }
}

/// Results of a batch, keyed by batch-local output dependency.
///
/// All-sites outputs hold one table per partition in partition order;
/// coordinator outputs hold a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResults {
    by_dep: BTreeMap<DependencyId, Vec<Table>>,
}

impl BatchResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dep: DependencyId, tables: Vec<Table>) {
        self.by_dep.insert(dep, tables);
    }

    /// Tables for a dependency; empty when the batch produced nothing for it.
    pub fn tables(&self, dep: DependencyId) -> &[Table] {
        self.by_dep.get(&dep).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First table for a dependency.
    pub fn first(&self, dep: DependencyId) -> Option<&Table> {
        self.tables(dep).first()
    }

    /// Sum of the scalar tables for a dependency.
    pub fn scalar_sum(&self, dep: DependencyId) -> i64 {
        self.tables(dep).iter().filter_map(Table::as_scalar).sum()
    }

    pub fn len(&self) -> usize {
        self.by_dep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dep.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Procedures
// ═══════════════════════════════════════════════════════════════════════════

/// What a procedure wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureStep {
    /// Execute this batch and resume with its results.
    Batch(Batch),
    /// The procedure finished; these tables go to the client.
    Done(Vec<Table>),
}

/// Facts about the transaction a procedure runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureContext {
    pub txn_id: TxnId,
    pub site_id: SiteId,
    pub partition_id: PartitionId,
    pub read_only: bool,
    pub single_partition: bool,
    pub num_partitions: u32,
}

/// A started procedure, suspended between batches.
pub trait ProcedureRun: Send {
    /// Continue the procedure. `previous` is `None` on the first call and the
    /// results of the last batch afterwards.
    fn resume(&mut self, previous: Option<BatchResults>) -> Result<ProcedureStep, ProcedureError>;
}

/// A stored procedure.
pub trait Procedure: Send + Sync {
    /// Start a run for one invocation.
    fn start(
        &self,
        ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError>;
}
