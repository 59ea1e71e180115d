//! Multi-partition transactions.
//!
//! One state type covers both roles. The coordinating site owns the
//! procedure run and fans each batch out as fragment tasks; every other site
//! is a participant that executes the tasks it receives and then waits,
//! blocked, for the coordinator's commit or rollback.
//!
//! ```text
//!   coordinator                         participant
//!   ───────────                         ───────────
//!   resume() ─► Batch
//!   FragmentTask ─────────────────────► execute
//!   (local copy runs here)              FragmentResponse
//!   record ◄───────────────────────────
//!   ... more batches ...
//!   Done: commit, CompleteTransaction ─► commit / rollback
//! ```

use crate::{
    decide_orphan_outcome, Decision, DependencyTracker, ExecutionContext, StepOutcome, TxnCommon,
    TxnError, TxnPhase,
};
use indexmap::IndexSet;
use lockstep_core::{
    Batch, BatchResults, DependencyInputs, FragmentTarget, PlannedFragment, ProcedureContext,
    ProcedureError, ProcedureRun, ProcedureStep,
};
use lockstep_messages::{
    CompleteTransactionMessage, FragmentResponseMessage, FragmentStatus, FragmentTaskMessage,
    InitiateResponseMessage, InitiateTaskMessage, MultiPartitionParticipantMessage, SiteMessage,
};
use lockstep_types::{
    ClientResponse, DependencyId, FragmentId, Parameters, SiteId, StoredProcedureInvocation,
    Table, TxnId,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, instrument, trace, warn};

/// How a fault notice affected a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultImpact {
    /// No participant or coordinator of this transaction failed.
    Unaffected,
    /// Some participants failed; the coordinator stops waiting on them.
    ParticipantsRemoved,
    /// The coordinator failed; this participant must decide on its own.
    Orphaned,
}

// ═══════════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════════

/// One site's share of a multi-partition transaction.
#[derive(Debug)]
pub struct MultiPartitionParticipantTxnState {
    common: TxnCommon,
    /// Non-coordinating participants, in the order the initiator listed them.
    participants: IndexSet<SiteId>,
    /// Whether the initiator's message has placed this transaction in the
    /// site's admission queue.
    admitted: bool,
    orphaned: bool,
    role: Role,
}

#[derive(Debug)]
enum Role {
    Coordinator(CoordinatorWork),
    Participant(ParticipantWork),
}

struct CoordinatorWork {
    invocation: StoredProcedureInvocation,
    run: Option<Box<dyn ProcedureRun>>,
    read_only: bool,
    batches_issued: usize,
    final_issued: bool,
    next_dep: u32,
    next_unique_id: u64,
    batch: Option<ActiveBatch>,
    failure: Option<ProcedureError>,
}

impl fmt::Debug for CoordinatorWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorWork")
            .field("procedure", &self.invocation.procedure)
            .field("started", &self.run.is_some())
            .field("batches_issued", &self.batches_issued)
            .field("final_issued", &self.final_issued)
            .field("batch", &self.batch)
            .field("failure", &self.failure)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ParticipantWork {
    queued: VecDeque<FragmentTaskMessage>,
    completion: Option<CompleteTransactionMessage>,
    final_task_seen: bool,
}

/// A batch in flight at the coordinator.
#[derive(Debug)]
struct ActiveBatch {
    unique_id: u64,
    /// Batch-local output id to txn-unique id.
    local_to_global: BTreeMap<DependencyId, DependencyId>,
    /// Txn-unique ids fed by all-sites fragments.
    remote: BTreeSet<DependencyId>,
    tracker: DependencyTracker,
    /// Coordinator fragments not yet run, batch-local ids.
    coordinator_fragments: VecDeque<PlannedFragment>,
    /// Coordinator fragment outputs, keyed by txn-unique id.
    local_outputs: BTreeMap<DependencyId, Table>,
}

enum BatchPoll {
    Pending,
    Complete(BatchResults),
    Failed(ProcedureError),
}

impl MultiPartitionParticipantTxnState {
    /// State for the coordinating site.
    pub fn coordinator(task: InitiateTaskMessage) -> Self {
        let common = TxnCommon::new(
            task.txn_id,
            task.initiator_id,
            task.coordinator_site_id,
            task.read_only,
            false,
        );
        let participants = task
            .participant_site_ids
            .iter()
            .copied()
            .filter(|site| *site != task.coordinator_site_id)
            .collect();
        Self {
            common,
            participants,
            admitted: true,
            orphaned: false,
            role: Role::Coordinator(CoordinatorWork {
                read_only: task.read_only,
                invocation: task.invocation,
                run: None,
                batches_issued: 0,
                final_issued: false,
                next_dep: 0,
                next_unique_id: 0,
                batch: None,
                failure: None,
            }),
        }
    }

    /// State for a non-coordinating participant, from the initiator's notice.
    pub fn participant(notice: &MultiPartitionParticipantMessage) -> Self {
        Self {
            common: TxnCommon::new(
                notice.txn_id,
                notice.initiator_id,
                notice.coordinator_site_id,
                notice.read_only,
                false,
            ),
            participants: IndexSet::new(),
            admitted: true,
            orphaned: false,
            role: Role::Participant(ParticipantWork::default()),
        }
    }

    /// State for a participant whose first fragment overtook the initiator's
    /// notice. It is not admissible until [`admit`](Self::admit) is called.
    pub fn early(task: &FragmentTaskMessage) -> Self {
        Self::unadmitted(
            task.txn_id,
            task.initiator_id,
            task.coordinator_site_id,
            task.read_only,
            ParticipantWork::default(),
        )
    }

    /// State for a participant whose coordinator finished before the
    /// initiator's notice arrived, e.g. a procedure that issued no batches.
    pub fn early_completion(message: CompleteTransactionMessage) -> Self {
        Self::unadmitted(
            message.txn_id,
            message.initiator_id,
            message.coordinator_site_id,
            false,
            ParticipantWork {
                completion: Some(message),
                ..Default::default()
            },
        )
    }

    fn unadmitted(
        txn_id: TxnId,
        initiator_id: SiteId,
        coordinator_site_id: SiteId,
        read_only: bool,
        work: ParticipantWork,
    ) -> Self {
        Self {
            common: TxnCommon::new(txn_id, initiator_id, coordinator_site_id, read_only, false),
            participants: IndexSet::new(),
            admitted: false,
            orphaned: false,
            role: Role::Participant(work),
        }
    }

    /// Mark the initiator's notice as received.
    pub fn admit(&mut self) {
        self.admitted = true;
    }

    pub fn common(&self) -> &TxnCommon {
        &self.common
    }

    pub fn txn_id(&self) -> TxnId {
        self.common.txn_id
    }

    pub fn coordinator_site_id(&self) -> SiteId {
        self.common.coordinator_site_id
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self.role, Role::Coordinator(_))
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    /// Surviving non-coordinating participants, in initiator order.
    pub fn participants(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.participants.iter().copied()
    }

    /// Results still outstanding for the batch in flight, by dependency.
    pub fn outstanding_dependencies(&self) -> BTreeMap<DependencyId, usize> {
        match &self.role {
            Role::Coordinator(CoordinatorWork {
                batch: Some(batch), ..
            }) => batch
                .remote
                .iter()
                .map(|dep| (*dep, batch.tracker.outstanding(*dep)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound messages
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a fragment for execution once this transaction is current.
    pub fn queue_task(&mut self, task: FragmentTaskMessage) -> Result<(), TxnError> {
        match &mut self.role {
            Role::Participant(work) => {
                trace!(txn_id = %self.common.txn_id, fragment = %task.fragment_id, "queue fragment");
                work.queued.push_back(task);
                Ok(())
            }
            Role::Coordinator(_) => Err(TxnError::UnexpectedMessage {
                txn_id: self.common.txn_id,
                message: "FragmentTask",
            }),
        }
    }

    /// Fold a participant's fragment result into the batch in flight.
    ///
    /// Returns false when the response was stale or from a site no longer
    /// participating.
    pub fn record_response(&mut self, response: FragmentResponseMessage) -> Result<bool, TxnError> {
        let work = match &mut self.role {
            Role::Coordinator(work) => work,
            Role::Participant(_) => {
                return Err(TxnError::UnexpectedMessage {
                    txn_id: self.common.txn_id,
                    message: "FragmentResponse",
                })
            }
        };
        if !self.participants.contains(&response.executor_site_id) {
            return Ok(false);
        }
        let Some(batch) = work.batch.as_mut() else {
            return Ok(false);
        };
        if response.unique_id != batch.unique_id {
            return Ok(false);
        }
        match response.status {
            FragmentStatus::Success => {
                for (dep, table) in response.dependencies {
                    batch
                        .tracker
                        .record(dep, response.executor_site_id, response.partition_id, table);
                }
            }
            FragmentStatus::UserError(reason) | FragmentStatus::UnexpectedError(reason) => {
                work.failure.get_or_insert(ProcedureError::Remote {
                    site: response.executor_site_id,
                    reason,
                });
            }
        }
        Ok(true)
    }

    /// Record the coordinator's decision. It is applied the next time the
    /// transaction runs.
    pub fn record_completion(&mut self, message: CompleteTransactionMessage) -> Result<(), TxnError> {
        match &mut self.role {
            Role::Participant(work) => {
                work.completion = Some(message);
                Ok(())
            }
            Role::Coordinator(_) => Err(TxnError::UnexpectedMessage {
                txn_id: self.common.txn_id,
                message: "CompleteTransaction",
            }),
        }
    }

    /// Whether the coordinator's decision has arrived.
    pub fn has_completion(&self) -> bool {
        matches!(
            &self.role,
            Role::Participant(ParticipantWork {
                completion: Some(_),
                ..
            })
        )
    }

    /// Forget failed sites.
    ///
    /// Dead participants leave the participant list and every outstanding
    /// dependency; survivors keep their relative order. Idempotent.
    pub fn handle_site_faults(&mut self, failed: &BTreeSet<SiteId>) -> FaultImpact {
        let before = self.participants.len();
        self.participants.retain(|site| !failed.contains(site));
        let removed = self.participants.len() != before;

        match &mut self.role {
            Role::Coordinator(work) => {
                if let Some(batch) = work.batch.as_mut() {
                    batch.tracker.remove_sites(failed);
                }
            }
            Role::Participant(_) => {
                if failed.contains(&self.common.coordinator_site_id) {
                    self.orphaned = true;
                    return FaultImpact::Orphaned;
                }
            }
        }
        if removed {
            FaultImpact::ParticipantsRemoved
        } else {
            FaultImpact::Unaffected
        }
    }

    /// Decide an orphaned participant by comparing against the newest
    /// multi-partition transaction known to have committed.
    pub fn resolve_orphan(&mut self, globally_committed: TxnId) -> StepOutcome {
        if let Role::Participant(work) = &mut self.role {
            work.queued.clear();
        }
        let decision = decide_orphan_outcome(self.common.txn_id, globally_committed);
        debug!(
            txn_id = %self.common.txn_id,
            globally_committed = %globally_committed,
            ?decision,
            "Resolved orphaned participant"
        );
        self.common.finish(decision)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Drive the transaction as far as it can go without other sites.
    #[instrument(skip(self, ctx), fields(txn_id = %self.common.txn_id, coordinator = self.is_coordinator()))]
    pub fn step(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<StepOutcome, TxnError> {
        if self.common.done {
            let decision = if self.common.needs_rollback {
                Decision::Rollback
            } else {
                Decision::Commit
            };
            return Ok(StepOutcome::Finished(decision));
        }
        if self.common.phase == TxnPhase::Created {
            self.common.phase = TxnPhase::Running;
        }
        match &mut self.role {
            Role::Coordinator(work) => work.step(&mut self.common, &self.participants, ctx),
            Role::Participant(work) => Ok(work.step(&mut self.common, ctx)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════

impl CoordinatorWork {
    fn step(
        &mut self,
        common: &mut TxnCommon,
        participants: &IndexSet<SiteId>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<StepOutcome, TxnError> {
        let mut previous = if self.run.is_none() {
            if let Err(e) = self.start(common, ctx) {
                return Ok(self.conclude(common, participants, ctx, Err(e)));
            }
            None
        } else {
            match self.poll_batch(common.txn_id, ctx)? {
                BatchPoll::Pending => return Ok(block(common)),
                BatchPoll::Complete(results) => Some(results),
                BatchPoll::Failed(e) => return Ok(self.conclude(common, participants, ctx, Err(e))),
            }
        };

        loop {
            let step = match self.run.as_mut() {
                Some(run) => run.resume(previous.take()),
                None => Err(ProcedureError::InvalidBatch("procedure not started".into())),
            };
            let batch = match step {
                Ok(ProcedureStep::Batch(batch)) => batch,
                Ok(ProcedureStep::Done(results)) => {
                    return Ok(self.conclude(common, participants, ctx, Ok(results)))
                }
                Err(e) => return Ok(self.conclude(common, participants, ctx, Err(e))),
            };
            if let Err(e) = self.issue_batch(common, participants, ctx, batch) {
                return Ok(self.conclude(common, participants, ctx, Err(e)));
            }
            match self.poll_batch(common.txn_id, ctx)? {
                BatchPoll::Pending => return Ok(block(common)),
                BatchPoll::Complete(results) => previous = Some(results),
                BatchPoll::Failed(e) => return Ok(self.conclude(common, participants, ctx, Err(e))),
            }
        }
    }

    fn start(&mut self, common: &TxnCommon, ctx: &ExecutionContext<'_>) -> Result<(), ProcedureError> {
        let name = &self.invocation.procedure;
        let info = ctx
            .catalog
            .get(name)
            .ok_or_else(|| ProcedureError::UnknownProcedure(name.clone()))?;
        self.read_only = common.read_only || info.read_only;
        let proc_ctx = ProcedureContext {
            txn_id: common.txn_id,
            site_id: ctx.site_id,
            partition_id: ctx.partition_id,
            read_only: self.read_only,
            single_partition: false,
            num_partitions: ctx.num_partitions,
        };
        self.run = Some(info.procedure.start(&proc_ctx, &self.invocation.params)?);
        Ok(())
    }

    /// Renumber a batch, send its all-sites fragments and run their local
    /// copies.
    fn issue_batch(
        &mut self,
        common: &TxnCommon,
        participants: &IndexSet<SiteId>,
        ctx: &mut ExecutionContext<'_>,
        batch: Batch,
    ) -> Result<(), ProcedureError> {
        if self.final_issued {
            return Err(ProcedureError::InvalidBatch(
                "batch issued after the final batch".into(),
            ));
        }
        if self.batches_issued >= ctx.max_batches {
            return Err(ProcedureError::BatchLimitExceeded {
                limit: ctx.max_batches,
            });
        }
        batch.validate()?;
        self.batches_issued += 1;
        self.final_issued = batch.is_final;
        self.next_unique_id += 1;

        let mut active = ActiveBatch {
            unique_id: self.next_unique_id,
            local_to_global: BTreeMap::new(),
            remote: BTreeSet::new(),
            tracker: DependencyTracker::new(),
            coordinator_fragments: VecDeque::new(),
            local_outputs: BTreeMap::new(),
        };
        for fragment in &batch.fragments {
            active
                .local_to_global
                .insert(fragment.output_dep, DependencyId(self.next_dep));
            self.next_dep += 1;
        }

        let mut local_copies: Vec<(FragmentId, Parameters, DependencyId)> = Vec::new();
        for fragment in batch.fragments {
            let output = active.global(fragment.output_dep);
            match fragment.target {
                FragmentTarget::AllSites => {
                    let task = FragmentTaskMessage {
                        initiator_id: common.initiator_id,
                        coordinator_site_id: ctx.site_id,
                        txn_id: common.txn_id,
                        unique_id: active.unique_id,
                        read_only: self.read_only,
                        fragment_id: fragment.fragment_id,
                        output_dep_id: output,
                        input_dep_ids: Vec::new(),
                        parameters: fragment.params.clone(),
                        is_final_task: batch.is_final,
                    };
                    ctx.outbox
                        .send_many(participants.iter(), SiteMessage::FragmentTask(task));
                    active.remote.insert(output);
                    active.tracker.expect(
                        output,
                        participants
                            .iter()
                            .copied()
                            .chain(std::iter::once(ctx.site_id)),
                    );
                    local_copies.push((fragment.fragment_id, fragment.params, output));
                }
                FragmentTarget::Coordinator => active.coordinator_fragments.push_back(fragment),
            }
        }
        debug!(
            txn_id = %common.txn_id,
            batch = self.batches_issued,
            unique_id = active.unique_id,
            remote = local_copies.len(),
            local = active.coordinator_fragments.len(),
            is_final = batch.is_final,
            "Issued batch"
        );

        for (fragment_id, params, output) in local_copies {
            let table = ctx.execute(
                common.txn_id,
                fragment_id,
                &params,
                &DependencyInputs::new(),
                self.read_only,
            )?;
            active
                .tracker
                .record(output, ctx.site_id, ctx.partition_id, table);
        }
        self.batch = Some(active);
        Ok(())
    }

    /// Run whatever local work is ready and report whether the batch is done.
    fn poll_batch(
        &mut self,
        txn_id: TxnId,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<BatchPoll, TxnError> {
        if let Some(e) = self.failure.take() {
            return Ok(BatchPoll::Failed(e));
        }
        let Some(batch) = self.batch.as_mut() else {
            return Ok(BatchPoll::Failed(ProcedureError::InvalidBatch(
                "no batch in flight".into(),
            )));
        };

        while let Some(front) = batch.coordinator_fragments.front() {
            if !front.input_deps.iter().all(|dep| batch.is_available(*dep)) {
                break;
            }
            let Some(fragment) = batch.coordinator_fragments.pop_front() else {
                break;
            };
            let mut inputs = DependencyInputs::new();
            for dep in &fragment.input_deps {
                inputs.insert(*dep, batch.tables(txn_id, *dep)?);
            }
            match ctx.execute(
                txn_id,
                fragment.fragment_id,
                &fragment.params,
                &inputs,
                self.read_only,
            ) {
                Ok(table) => {
                    let output = batch.global(fragment.output_dep);
                    batch.local_outputs.insert(output, table);
                }
                Err(e) => return Ok(BatchPoll::Failed(e.into())),
            }
        }

        if !batch.coordinator_fragments.is_empty() || !batch.tracker.all_satisfied() {
            return Ok(BatchPoll::Pending);
        }

        let mut results = BatchResults::new();
        for local in batch.local_to_global.keys() {
            results.insert(*local, batch.tables(txn_id, *local)?);
        }
        self.batch = None;
        Ok(BatchPoll::Complete(results))
    }

    /// Queue the completion for every participant and the client response.
    fn conclude(
        &mut self,
        common: &mut TxnCommon,
        participants: &IndexSet<SiteId>,
        ctx: &mut ExecutionContext<'_>,
        outcome: Result<Vec<Table>, ProcedureError>,
    ) -> StepOutcome {
        self.batch = None;
        self.run = None;
        let (decision, response) = match outcome {
            Ok(results) => (Decision::Commit, ClientResponse::success(results)),
            Err(e) => {
                debug!(txn_id = %common.txn_id, error = %e, "Multi-partition procedure failed");
                (
                    Decision::Rollback,
                    ClientResponse::failure(e.response_status(), e.to_string()),
                )
            }
        };
        ctx.outbox.send_many(
            participants.iter(),
            SiteMessage::CompleteTransaction(CompleteTransactionMessage {
                initiator_id: common.initiator_id,
                coordinator_site_id: ctx.site_id,
                txn_id: common.txn_id,
                rollback: decision == Decision::Rollback,
            }),
        );
        ctx.outbox.send(
            common.initiator_id,
            SiteMessage::InitiateResponse(InitiateResponseMessage {
                txn_id: common.txn_id,
                initiator_id: common.initiator_id,
                site_id: ctx.site_id,
                partition_id: ctx.partition_id,
                client_handle: self.invocation.client_handle,
                response,
            }),
        );
        common.finish(decision)
    }
}

impl ActiveBatch {
    fn global(&self, local: DependencyId) -> DependencyId {
        self.local_to_global.get(&local).copied().unwrap_or(local)
    }

    fn is_available(&self, local: DependencyId) -> bool {
        let global = self.global(local);
        self.local_outputs.contains_key(&global)
            || (self.remote.contains(&global) && self.tracker.is_satisfied(global))
    }

    /// Tables for a batch-local dependency.
    fn tables(&self, txn_id: TxnId, local: DependencyId) -> Result<Vec<Table>, TxnError> {
        let global = self.global(local);
        match self.local_outputs.get(&global) {
            Some(table) => Ok(vec![table.clone()]),
            None => self.tracker.tables_by_partition(txn_id, global),
        }
    }
}

fn block(common: &mut TxnCommon) -> StepOutcome {
    common.phase = TxnPhase::BlockedOnDependency;
    StepOutcome::Blocked
}

// ═══════════════════════════════════════════════════════════════════════════
// Participant
// ═══════════════════════════════════════════════════════════════════════════

impl ParticipantWork {
    fn step(&mut self, common: &mut TxnCommon, ctx: &mut ExecutionContext<'_>) -> StepOutcome {
        if let Some(completion) = self.completion {
            if completion.rollback {
                self.queued.clear();
                return common.finish(Decision::Rollback);
            }
        }

        while let Some(task) = self.queued.pop_front() {
            let result = ctx.execute(
                common.txn_id,
                task.fragment_id,
                &task.parameters,
                &DependencyInputs::new(),
                task.read_only,
            );
            let response = match result {
                Ok(table) => FragmentResponseMessage::success(
                    ctx.site_id,
                    ctx.partition_id,
                    common.txn_id,
                    task.unique_id,
                    vec![(task.output_dep_id, table)],
                ),
                Err(e) => {
                    let status = if e.is_user_error() {
                        FragmentStatus::UserError(e.to_string())
                    } else {
                        warn!(txn_id = %common.txn_id, error = %e, "Fragment failed");
                        FragmentStatus::UnexpectedError(e.to_string())
                    };
                    FragmentResponseMessage::failure(
                        ctx.site_id,
                        ctx.partition_id,
                        common.txn_id,
                        task.unique_id,
                        status,
                    )
                }
            };
            self.final_task_seen |= task.is_final_task;
            ctx.outbox.send(
                common.coordinator_site_id,
                SiteMessage::FragmentResponse(response),
            );
        }

        match self.completion {
            Some(completion) => {
                let decision = if completion.rollback {
                    Decision::Rollback
                } else {
                    Decision::Commit
                };
                common.finish(decision)
            }
            None => block(common),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outbox;
    use lockstep_core::{
        FragmentEngine, Procedure, ProcedureCatalog, ProcedureInfo, ProcedureKind,
    };
    use lockstep_engine::{FragmentLibrary, MemoryEngine};
    use lockstep_types::test_utils::invocation;
    use lockstep_types::{ParamValue, PartitionId, ResponseStatus};
    use std::sync::Arc;

    const BUMP: FragmentId = FragmentId(1);
    const SUM: FragmentId = FragmentId(2);
    const COORD: SiteId = SiteId(1);

    /// Each site bumps its counter and reports it; the coordinator sums.
    struct BumpAndSum;

    struct BumpAndSumRun {
        issued: bool,
    }

    impl Procedure for BumpAndSum {
        fn start(
            &self,
            _ctx: &ProcedureContext,
            _params: &Parameters,
        ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
            Ok(Box::new(BumpAndSumRun { issued: false }))
        }
    }

    impl ProcedureRun for BumpAndSumRun {
        fn resume(
            &mut self,
            previous: Option<BatchResults>,
        ) -> Result<ProcedureStep, ProcedureError> {
            if !self.issued {
                self.issued = true;
                return Ok(ProcedureStep::Batch(Batch::final_batch(vec![
                    PlannedFragment::all_sites(BUMP, Parameters::new(), DependencyId(0)),
                    PlannedFragment::coordinator(
                        SUM,
                        Parameters::new(),
                        DependencyId(1),
                        vec![DependencyId(0)],
                    ),
                ])));
            }
            let results = previous.unwrap_or_default();
            Ok(ProcedureStep::Done(results.tables(DependencyId(1)).to_vec()))
        }
    }

    /// Issues an unbounded chain of single-fragment batches.
    struct Endless;

    struct EndlessRun;

    impl Procedure for Endless {
        fn start(
            &self,
            _ctx: &ProcedureContext,
            _params: &Parameters,
        ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
            Ok(Box::new(EndlessRun))
        }
    }

    impl ProcedureRun for EndlessRun {
        fn resume(
            &mut self,
            _previous: Option<BatchResults>,
        ) -> Result<ProcedureStep, ProcedureError> {
            Ok(ProcedureStep::Batch(Batch::new(vec![PlannedFragment::all_sites(
                BUMP,
                Parameters::new(),
                DependencyId(0),
            )])))
        }
    }

    fn library() -> Arc<FragmentLibrary> {
        let mut lib = FragmentLibrary::new();
        lib.register(BUMP, |view, _, _| {
            let next = view.get_int(b"counter")?.unwrap_or_default() + 1;
            view.put_int(b"counter", next)?;
            Ok(Table::scalar(next))
        })
        .unwrap();
        lib.register(SUM, |_, _, inputs| {
            let total = inputs
                .iter()
                .flat_map(|(_, tables)| tables.iter())
                .filter_map(Table::as_scalar)
                .sum();
            Ok(Table::scalar(total))
        })
        .unwrap();
        Arc::new(lib)
    }

    fn catalog() -> ProcedureCatalog {
        let mut catalog = ProcedureCatalog::new();
        catalog
            .register(ProcedureInfo::new(
                "BumpAndSum",
                ProcedureKind::MultiPartition,
                false,
                BumpAndSum,
            ))
            .unwrap();
        catalog
            .register(ProcedureInfo::new(
                "Endless",
                ProcedureKind::MultiPartition,
                false,
                Endless,
            ))
            .unwrap();
        catalog
    }

    struct Harness {
        site_id: SiteId,
        partition_id: PartitionId,
        engine: MemoryEngine,
        catalog: ProcedureCatalog,
        outbox: Outbox,
        max_batches: usize,
    }

    impl Harness {
        fn new(site: u64, partition: u32) -> Self {
            Self {
                site_id: SiteId(site),
                partition_id: PartitionId(partition),
                engine: MemoryEngine::new(PartitionId(partition), library()),
                catalog: catalog(),
                outbox: Outbox::new(),
                max_batches: 16,
            }
        }

        fn step(&mut self, state: &mut MultiPartitionParticipantTxnState) -> StepOutcome {
            let mut ctx = ExecutionContext::new(
                self.site_id,
                self.partition_id,
                2,
                self.max_batches,
                &mut self.engine,
                &self.catalog,
                &mut self.outbox,
            );
            state.step(&mut ctx).unwrap()
        }
    }

    fn coordinator_task(txn: u64, procedure: &str, participants: &[u64]) -> InitiateTaskMessage {
        InitiateTaskMessage::multi_partition(
            SiteId(100),
            COORD,
            TxnId(txn),
            false,
            invocation(procedure, &[]),
            TxnId::NONE,
            participants.iter().map(|s| SiteId(*s)).collect(),
        )
    }

    fn notice(txn: u64) -> MultiPartitionParticipantMessage {
        MultiPartitionParticipantMessage {
            initiator_id: SiteId(100),
            coordinator_site_id: COORD,
            txn_id: TxnId(txn),
            read_only: false,
            safe_txn_id: TxnId::NONE,
        }
    }

    fn take_fragment_tasks(outbox: &mut Outbox) -> Vec<(SiteId, FragmentTaskMessage)> {
        outbox
            .drain()
            .into_iter()
            .filter_map(|out| match out.message {
                SiteMessage::FragmentTask(task) => Some((out.to, task)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handle_site_faults_preserves_survivor_order() {
        let mut state = MultiPartitionParticipantTxnState::coordinator(coordinator_task(
            1000,
            "BumpAndSum",
            &[2, 3, 4, 5, 6, 7, 8, 9],
        ));
        let failed: BTreeSet<SiteId> = [SiteId(3), SiteId(4), SiteId(6)].into_iter().collect();

        assert_eq!(state.handle_site_faults(&failed), FaultImpact::ParticipantsRemoved);
        let survivors: Vec<_> = state.participants().collect();
        assert_eq!(
            survivors,
            vec![SiteId(2), SiteId(5), SiteId(7), SiteId(8), SiteId(9)]
        );

        // Repeated discovery is a no-op.
        assert_eq!(state.handle_site_faults(&failed), FaultImpact::Unaffected);
        assert_eq!(state.participants().count(), 5);
    }

    #[test]
    fn test_coordinator_and_participant_commit() {
        let mut coord_site = Harness::new(1, 0);
        let mut part_site = Harness::new(2, 1);
        let mut coord = MultiPartitionParticipantTxnState::coordinator(coordinator_task(
            1000,
            "BumpAndSum",
            &[2],
        ));
        let mut part = MultiPartitionParticipantTxnState::participant(&notice(1000));

        assert_eq!(coord_site.step(&mut coord), StepOutcome::Blocked);
        assert_eq!(coord.common().phase, TxnPhase::BlockedOnDependency);
        let outstanding = coord.outstanding_dependencies();
        assert_eq!(outstanding.values().copied().collect::<Vec<_>>(), vec![1]);

        let tasks = take_fragment_tasks(&mut coord_site.outbox);
        assert_eq!(tasks.len(), 1);
        let (to, task) = tasks.into_iter().next().unwrap();
        assert_eq!(to, SiteId(2));
        assert!(task.is_final_task);

        part.queue_task(task).unwrap();
        assert_eq!(part_site.step(&mut part), StepOutcome::Blocked);
        let response = match part_site.outbox.drain().pop().unwrap().message {
            SiteMessage::FragmentResponse(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(response.partition_id, PartitionId(1));

        assert!(coord.record_response(response).unwrap());
        assert_eq!(
            coord_site.step(&mut coord),
            StepOutcome::Finished(Decision::Commit)
        );
        let sent = coord_site.outbox.drain();
        let completion = sent
            .iter()
            .find_map(|out| match &out.message {
                SiteMessage::CompleteTransaction(c) => Some(*c),
                _ => None,
            })
            .unwrap();
        assert!(!completion.rollback);
        let reply = sent
            .iter()
            .find_map(|out| match &out.message {
                SiteMessage::InitiateResponse(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert!(reply.response.is_success());
        // Both partitions bumped their counter to 1.
        assert_eq!(reply.response.results, vec![Table::scalar(2)]);

        part.record_completion(completion).unwrap();
        assert_eq!(
            part_site.step(&mut part),
            StepOutcome::Finished(Decision::Commit)
        );
        assert!(part.common().done);
    }

    #[test]
    fn test_remote_failure_rolls_back_everywhere() {
        let mut coord_site = Harness::new(1, 0);
        let mut coord = MultiPartitionParticipantTxnState::coordinator(coordinator_task(
            1000,
            "BumpAndSum",
            &[2],
        ));
        assert_eq!(coord_site.step(&mut coord), StepOutcome::Blocked);
        let task = take_fragment_tasks(&mut coord_site.outbox).remove(0).1;

        let failure = FragmentResponseMessage::failure(
            SiteId(2),
            PartitionId(1),
            TxnId(1000),
            task.unique_id,
            FragmentStatus::UnexpectedError("disk on fire".into()),
        );
        assert!(coord.record_response(failure).unwrap());
        assert_eq!(
            coord_site.step(&mut coord),
            StepOutcome::Finished(Decision::Rollback)
        );
        let sent = coord_site.outbox.drain();
        assert!(sent.iter().any(|out| matches!(
            &out.message,
            SiteMessage::CompleteTransaction(c) if c.rollback && out.to == SiteId(2)
        )));
        assert!(sent.iter().any(|out| matches!(
            &out.message,
            SiteMessage::InitiateResponse(r) if r.response.status == ResponseStatus::GracefulFailure
        )));
    }

    #[test]
    fn test_coordinator_stops_waiting_on_dead_participant() {
        let mut coord_site = Harness::new(1, 0);
        let mut coord = MultiPartitionParticipantTxnState::coordinator(coordinator_task(
            1000,
            "BumpAndSum",
            &[2, 3],
        ));
        assert_eq!(coord_site.step(&mut coord), StepOutcome::Blocked);
        let task = take_fragment_tasks(&mut coord_site.outbox).remove(0).1;

        let from_two = FragmentResponseMessage::success(
            SiteId(2),
            PartitionId(1),
            TxnId(1000),
            task.unique_id,
            vec![(task.output_dep_id, Table::scalar(1))],
        );
        assert!(coord.record_response(from_two).unwrap());
        assert_eq!(coord_site.step(&mut coord), StepOutcome::Blocked);

        let failed: BTreeSet<SiteId> = [SiteId(3)].into_iter().collect();
        assert_eq!(coord.handle_site_faults(&failed), FaultImpact::ParticipantsRemoved);
        assert_eq!(
            coord_site.step(&mut coord),
            StepOutcome::Finished(Decision::Commit)
        );
        let completions: Vec<_> = coord_site
            .outbox
            .drain()
            .into_iter()
            .filter(|out| matches!(out.message, SiteMessage::CompleteTransaction(_)))
            .map(|out| out.to)
            .collect();
        assert_eq!(completions, vec![SiteId(2)]);
    }

    #[test]
    fn test_batch_limit_is_a_graceful_failure() {
        let mut coord_site = Harness::new(1, 0);
        coord_site.max_batches = 3;
        // No participants: every batch completes locally, so the chain runs
        // straight into the limit within one step.
        let mut coord = MultiPartitionParticipantTxnState::coordinator(coordinator_task(
            1000,
            "Endless",
            &[],
        ));
        assert_eq!(
            coord_site.step(&mut coord),
            StepOutcome::Finished(Decision::Rollback)
        );
        let reply = coord_site
            .outbox
            .drain()
            .into_iter()
            .find_map(|out| match out.message {
                SiteMessage::InitiateResponse(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert_eq!(reply.response.status, ResponseStatus::GracefulFailure);
        assert!(reply
            .response
            .status_string
            .unwrap_or_default()
            .contains("3 batches"));
        // Three batches ran locally before the limit tripped.
        assert_eq!(coord_site.engine.get(b"counter"), Some(&3i64.to_le_bytes()[..]));
    }

    #[test]
    fn test_orphan_decision_against_global_commit_point() {
        let mut below = MultiPartitionParticipantTxnState::participant(&notice(999));
        let mut above = MultiPartitionParticipantTxnState::participant(&notice(1001));
        let failed: BTreeSet<SiteId> = [COORD].into_iter().collect();

        assert_eq!(below.handle_site_faults(&failed), FaultImpact::Orphaned);
        assert_eq!(above.handle_site_faults(&failed), FaultImpact::Orphaned);
        assert!(below.is_orphaned());

        assert_eq!(
            below.resolve_orphan(TxnId(1000)),
            StepOutcome::Finished(Decision::Commit)
        );
        assert_eq!(
            above.resolve_orphan(TxnId(1000)),
            StepOutcome::Finished(Decision::Rollback)
        );
        assert_eq!(above.common().phase, TxnPhase::RolledBack);
    }

    #[test]
    fn test_early_fragment_waits_for_admission() {
        let task = FragmentTaskMessage {
            initiator_id: SiteId(100),
            coordinator_site_id: COORD,
            txn_id: TxnId(1000),
            unique_id: 1,
            read_only: false,
            fragment_id: BUMP,
            output_dep_id: DependencyId(0),
            input_dep_ids: Vec::new(),
            parameters: Parameters::new().with(ParamValue::Null),
            is_final_task: true,
        };
        let mut state = MultiPartitionParticipantTxnState::early(&task);
        assert!(!state.is_admitted());
        state.queue_task(task).unwrap();
        state.admit();
        assert!(state.is_admitted());

        let mut site = Harness::new(2, 1);
        assert_eq!(site.step(&mut state), StepOutcome::Blocked);
        assert_eq!(site.outbox.len(), 1);
        assert_eq!(site.engine.open_transactions(), 1);

        state
            .record_completion(CompleteTransactionMessage {
                initiator_id: SiteId(100),
                coordinator_site_id: COORD,
                txn_id: TxnId(1000),
                rollback: true,
            })
            .unwrap();
        assert_eq!(
            site.step(&mut state),
            StepOutcome::Finished(Decision::Rollback)
        );
        // Applying the decision is the site's job.
        site.engine.rollback(TxnId(1000));
        assert_eq!(site.engine.get(b"counter"), None);
    }

    #[test]
    fn test_early_completion_finishes_once_admitted() {
        let mut state = MultiPartitionParticipantTxnState::early_completion(
            CompleteTransactionMessage {
                initiator_id: SiteId(100),
                coordinator_site_id: COORD,
                txn_id: TxnId(1000),
                rollback: true,
            },
        );
        assert!(!state.is_admitted());
        assert!(state.has_completion());
        assert_eq!(state.coordinator_site_id(), COORD);

        state.admit();
        let mut site = Harness::new(2, 1);
        assert_eq!(
            site.step(&mut state),
            StepOutcome::Finished(Decision::Rollback)
        );
        assert!(site.outbox.is_empty());
    }

    #[test]
    fn test_role_mismatches_are_rejected() {
        let mut part = MultiPartitionParticipantTxnState::participant(&notice(5));
        let response = FragmentResponseMessage::success(
            SiteId(2),
            PartitionId(1),
            TxnId(5),
            1,
            Vec::new(),
        );
        assert!(matches!(
            part.record_response(response),
            Err(TxnError::UnexpectedMessage { .. })
        ));
    }
}
