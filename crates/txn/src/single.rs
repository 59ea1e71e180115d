//! Single-partition transactions.

use crate::{Decision, ExecutionContext, StepOutcome, TxnCommon, TxnPhase};
use lockstep_core::{
    Batch, BatchResults, DependencyInputs, ProcedureContext, ProcedureError, ProcedureStep,
};
use lockstep_messages::{InitiateResponseMessage, InitiateTaskMessage, SiteMessage};
use lockstep_types::{ClientResponse, SiteId, Table, TxnId};
use tracing::{debug, instrument};

/// A transaction whose procedure runs entirely on this site's partition.
#[derive(Debug, Clone)]
pub struct SinglePartitionTxnState {
    common: TxnCommon,
    task: InitiateTaskMessage,
}

impl SinglePartitionTxnState {
    pub fn new(task: InitiateTaskMessage) -> Self {
        let common = TxnCommon::new(
            task.txn_id,
            task.initiator_id,
            task.coordinator_site_id,
            task.read_only,
            true,
        );
        Self { common, task }
    }

    pub fn common(&self) -> &TxnCommon {
        &self.common
    }

    pub fn txn_id(&self) -> TxnId {
        self.common.txn_id
    }

    pub fn initiator_id(&self) -> SiteId {
        self.common.initiator_id
    }

    /// Run the procedure to completion and queue the client response.
    ///
    /// Procedure failures roll back; they are not errors of the step.
    #[instrument(skip(self, ctx), fields(txn_id = %self.common.txn_id))]
    pub fn run(&mut self, ctx: &mut ExecutionContext<'_>) -> StepOutcome {
        self.common.phase = TxnPhase::Running;
        let (decision, response) = match self.execute(ctx) {
            Ok(results) => (Decision::Commit, ClientResponse::success(results)),
            Err(e) => {
                debug!(error = %e, "Single-partition procedure failed");
                (
                    Decision::Rollback,
                    ClientResponse::failure(e.response_status(), e.to_string()),
                )
            }
        };
        ctx.outbox.send(
            self.common.initiator_id,
            SiteMessage::InitiateResponse(InitiateResponseMessage {
                txn_id: self.common.txn_id,
                initiator_id: self.common.initiator_id,
                site_id: ctx.site_id,
                partition_id: ctx.partition_id,
                client_handle: self.task.invocation.client_handle,
                response,
            }),
        );
        self.common.finish(decision)
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Vec<Table>, ProcedureError> {
        let name = &self.task.invocation.procedure;
        let info = ctx
            .catalog
            .get(name)
            .ok_or_else(|| ProcedureError::UnknownProcedure(name.clone()))?;
        let read_only = self.common.read_only || info.read_only;
        let procedure = info.procedure.clone();
        let proc_ctx = ProcedureContext {
            txn_id: self.common.txn_id,
            site_id: ctx.site_id,
            partition_id: ctx.partition_id,
            read_only,
            single_partition: true,
            num_partitions: ctx.num_partitions,
        };
        let mut run = procedure.start(&proc_ctx, &self.task.invocation.params)?;

        let mut previous = None;
        let mut batches = 0usize;
        let mut final_seen = false;
        loop {
            match run.resume(previous.take())? {
                ProcedureStep::Done(results) => return Ok(results),
                ProcedureStep::Batch(batch) => {
                    if final_seen {
                        return Err(ProcedureError::InvalidBatch(
                            "batch issued after the final batch".into(),
                        ));
                    }
                    batches += 1;
                    if batches > ctx.max_batches {
                        return Err(ProcedureError::BatchLimitExceeded {
                            limit: ctx.max_batches,
                        });
                    }
                    final_seen = batch.is_final;
                    previous = Some(run_local_batch(ctx, self.common.txn_id, read_only, &batch)?);
                }
            }
        }
    }
}

/// Execute every fragment of a batch on this site, in order.
///
/// On a single partition an all-sites fragment has exactly one site, so each
/// output holds one table.
fn run_local_batch(
    ctx: &mut ExecutionContext<'_>,
    txn_id: TxnId,
    read_only: bool,
    batch: &Batch,
) -> Result<BatchResults, ProcedureError> {
    batch.validate()?;
    let mut results = BatchResults::new();
    let mut produced = DependencyInputs::new();
    for fragment in &batch.fragments {
        let mut inputs = DependencyInputs::new();
        for dep in &fragment.input_deps {
            inputs.insert(*dep, produced.require(*dep)?.to_vec());
        }
        let table = ctx.execute(
            txn_id,
            fragment.fragment_id,
            &fragment.params,
            &inputs,
            read_only,
        )?;
        produced.insert(fragment.output_dep, vec![table.clone()]);
        results.insert(fragment.output_dep, vec![table]);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outbox;
    use lockstep_core::{
        FragmentError, PlannedFragment, Procedure, ProcedureCatalog, ProcedureInfo,
        ProcedureKind, ProcedureRun,
    };
    use lockstep_engine::{FragmentLibrary, MemoryEngine};
    use lockstep_types::test_utils::invocation;
    use lockstep_types::{DependencyId, FragmentId, Parameters, PartitionId, ResponseStatus};
    use std::sync::Arc;

    const ADD: FragmentId = FragmentId(1);

    /// Adds its first parameter to the counter and returns the new value.
    struct Add {
        batches: usize,
    }

    struct AddRun {
        amount: i64,
        remaining: usize,
    }

    impl Procedure for Add {
        fn start(
            &self,
            _ctx: &ProcedureContext,
            params: &Parameters,
        ) -> Result<Box<dyn lockstep_core::ProcedureRun>, ProcedureError> {
            let amount = params
                .int(0)
                .ok_or_else(|| ProcedureError::InvalidParameters("amount".into()))?;
            Ok(Box::new(AddRun {
                amount,
                remaining: self.batches,
            }))
        }
    }

    impl ProcedureRun for AddRun {
        fn resume(
            &mut self,
            previous: Option<BatchResults>,
        ) -> Result<ProcedureStep, ProcedureError> {
            if self.remaining == 0 {
                let results = previous.unwrap_or_default();
                return Ok(ProcedureStep::Done(results.tables(DependencyId(0)).to_vec()));
            }
            self.remaining -= 1;
            let fragment = PlannedFragment::all_sites(
                ADD,
                Parameters::new().with(lockstep_types::ParamValue::Int(self.amount)),
                DependencyId(0),
            );
            Ok(ProcedureStep::Batch(Batch::new(vec![fragment])))
        }
    }

    fn harness() -> (MemoryEngine, ProcedureCatalog) {
        let mut lib = FragmentLibrary::new();
        lib.register(ADD, |view, params, _| {
            let amount = params.int(0).ok_or(FragmentError::BadParameter {
                index: 0,
                reason: "expected an integer".into(),
            })?;
            let next = view.get_int(b"counter")?.unwrap_or_default() + amount;
            if next < 0 {
                return Err(FragmentError::Constraint("counter below zero".into()));
            }
            view.put_int(b"counter", next)?;
            Ok(Table::scalar(next))
        })
        .unwrap();
        let engine = MemoryEngine::new(PartitionId(0), Arc::new(lib));

        let mut catalog = ProcedureCatalog::new();
        catalog
            .register(ProcedureInfo::new(
                "Add",
                ProcedureKind::SinglePartition,
                false,
                Add { batches: 1 },
            ))
            .unwrap();
        catalog
            .register(ProcedureInfo::new(
                "AddFiveTimes",
                ProcedureKind::SinglePartition,
                false,
                Add { batches: 5 },
            ))
            .unwrap();
        (engine, catalog)
    }

    fn run(
        engine: &mut MemoryEngine,
        catalog: &ProcedureCatalog,
        max_batches: usize,
        txn: u64,
        procedure: &str,
        ints: &[i64],
    ) -> (StepOutcome, InitiateResponseMessage) {
        let task = InitiateTaskMessage::single_partition(
            SiteId(100),
            SiteId(1),
            TxnId(txn),
            false,
            invocation(procedure, ints),
            TxnId::NONE,
        );
        let mut state = SinglePartitionTxnState::new(task);
        let mut outbox = Outbox::new();
        let mut ctx = ExecutionContext::new(
            SiteId(1),
            PartitionId(0),
            1,
            max_batches,
            engine,
            catalog,
            &mut outbox,
        );
        let outcome = state.run(&mut ctx);
        let mut sent = outbox.drain();
        assert_eq!(sent.len(), 1);
        let out = sent.remove(0);
        assert_eq!(out.to, SiteId(100));
        match out.message {
            SiteMessage::InitiateResponse(response) => (outcome, response),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_single_partition_commit_returns_results() {
        let (mut engine, catalog) = harness();
        let (outcome, response) = run(&mut engine, &catalog, 8, 1000, "Add", &[7]);
        assert_eq!(outcome, StepOutcome::Finished(Decision::Commit));
        assert_eq!(response.txn_id, TxnId(1000));
        assert_eq!(response.response.results, vec![Table::scalar(7)]);
    }

    #[test]
    fn test_constraint_violation_is_a_user_abort() {
        let (mut engine, catalog) = harness();
        let (outcome, response) = run(&mut engine, &catalog, 8, 1000, "Add", &[-1]);
        assert_eq!(outcome, StepOutcome::Finished(Decision::Rollback));
        assert_eq!(response.response.status, ResponseStatus::UserAbort);
    }

    #[test]
    fn test_unknown_procedure_fails_gracefully() {
        let (mut engine, catalog) = harness();
        let (outcome, response) = run(&mut engine, &catalog, 8, 1000, "Missing", &[]);
        assert_eq!(outcome, StepOutcome::Finished(Decision::Rollback));
        assert_eq!(response.response.status, ResponseStatus::GracefulFailure);
        assert!(response
            .response
            .status_string
            .unwrap_or_default()
            .contains("Missing"));
    }

    #[test]
    fn test_batch_chain_respects_limit() {
        let (mut engine, catalog) = harness();
        let (outcome, response) = run(&mut engine, &catalog, 5, 1000, "AddFiveTimes", &[2]);
        assert_eq!(outcome, StepOutcome::Finished(Decision::Commit));
        assert_eq!(response.response.results, vec![Table::scalar(10)]);

        let (mut engine, catalog) = harness();
        let (outcome, response) = run(&mut engine, &catalog, 4, 1001, "AddFiveTimes", &[2]);
        assert_eq!(outcome, StepOutcome::Finished(Decision::Rollback));
        assert_eq!(response.response.status, ResponseStatus::GracefulFailure);
    }
}
