//! Counter procedures.

use crate::fragments::{ADD_COUNTER, READ_COUNTER, SUM_INPUTS};
use lockstep_core::{
    Batch, BatchResults, CatalogError, PlannedFragment, Procedure, ProcedureCatalog,
    ProcedureContext, ProcedureError, ProcedureInfo, ProcedureKind, ProcedureRun, ProcedureStep,
};
use lockstep_types::{DependencyId, ParamValue, Parameters, StoredProcedureInvocation};
use std::collections::VecDeque;
use std::sync::Arc;

pub const INCREMENT: &str = "Increment";
pub const MP_INCREMENT: &str = "MultiPartitionIncrement";
pub const FAILING: &str = "Failing";
pub const FAILING_MP: &str = "FailingMultiPartition";
pub const CHAINED: &str = "Chained";
pub const READ_TOTAL: &str = "ReadTotal";

const OUT: DependencyId = DependencyId(0);
const SUMMED: DependencyId = DependencyId(1);

// ═══════════════════════════════════════════════════════════════════════════
// Scripted runs
// ═══════════════════════════════════════════════════════════════════════════

/// Plays a fixed list of batches, then returns the tables of `result_dep`
/// from the last batch.
struct Scripted {
    batches: VecDeque<Batch>,
    result_dep: DependencyId,
}

impl ProcedureRun for Scripted {
    fn resume(&mut self, previous: Option<BatchResults>) -> Result<ProcedureStep, ProcedureError> {
        match self.batches.pop_front() {
            Some(batch) => Ok(ProcedureStep::Batch(batch)),
            None => {
                let results = previous.unwrap_or_default();
                Ok(ProcedureStep::Done(results.tables(self.result_dep).to_vec()))
            }
        }
    }
}

fn key_and_delta(params: &Parameters) -> Result<Parameters, ProcedureError> {
    match (params.int(0), params.int(1)) {
        (Some(key), Some(delta)) => Ok(Parameters::new()
            .with(ParamValue::Int(key))
            .with(ParamValue::Int(delta))),
        _ => Err(ProcedureError::InvalidParameters(
            "expected [key, delta]".into(),
        )),
    }
}

fn key_only(params: &Parameters) -> Result<Parameters, ProcedureError> {
    params
        .int(0)
        .map(|key| Parameters::new().with(ParamValue::Int(key)))
        .ok_or_else(|| ProcedureError::InvalidParameters("expected [key]".into()))
}

/// Run `fragment` everywhere, then sum the per-partition results at the
/// coordinator.
fn fan_out_and_sum(fragment: lockstep_types::FragmentId, params: Parameters) -> Scripted {
    Scripted {
        batches: VecDeque::from([Batch::final_batch(vec![
            PlannedFragment::all_sites(fragment, params, OUT),
            PlannedFragment::coordinator(SUM_INPUTS, Parameters::new(), SUMMED, vec![OUT]),
        ])]),
        result_dep: SUMMED,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Procedures
// ═══════════════════════════════════════════════════════════════════════════

struct Increment;

impl Procedure for Increment {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        let params = key_and_delta(params)?;
        Ok(Box::new(Scripted {
            batches: VecDeque::from([Batch::final_batch(vec![PlannedFragment::all_sites(
                ADD_COUNTER,
                params,
                OUT,
            )])]),
            result_dep: OUT,
        }))
    }
}

struct MultiPartitionIncrement;

impl Procedure for MultiPartitionIncrement {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        Ok(Box::new(fan_out_and_sum(ADD_COUNTER, key_and_delta(params)?)))
    }
}

struct ReadTotal;

impl Procedure for ReadTotal {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        Ok(Box::new(fan_out_and_sum(READ_COUNTER, key_only(params)?)))
    }
}

/// Aborts on its first step.
struct Failing;

struct FailingRun;

impl Procedure for Failing {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        _params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        Ok(Box::new(FailingRun))
    }
}

impl ProcedureRun for FailingRun {
    fn resume(&mut self, _previous: Option<BatchResults>) -> Result<ProcedureStep, ProcedureError> {
        Err(ProcedureError::UserAbort("requested abort".into()))
    }
}

/// Drives a counter below zero on every partition.
struct FailingMultiPartition;

impl Procedure for FailingMultiPartition {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        let key = key_only(params)?
            .int(0)
            .ok_or_else(|| ProcedureError::InvalidParameters("expected [key]".into()))?;
        let params = Parameters::new()
            .with(ParamValue::Int(key))
            .with(ParamValue::Int(i64::MIN / 2));
        Ok(Box::new(fan_out_and_sum(ADD_COUNTER, params)))
    }
}

/// `[n]`: `n` read batches, each issued after the previous one finished.
struct Chained;

impl Procedure for Chained {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        let n = params
            .int(0)
            .filter(|n| *n >= 0)
            .ok_or_else(|| ProcedureError::InvalidParameters("expected [n >= 0]".into()))?;
        let read = Parameters::new().with(ParamValue::Int(0));
        let batches = (0..n)
            .map(|i| {
                let fragments = vec![PlannedFragment::all_sites(READ_COUNTER, read.clone(), OUT)];
                if i + 1 == n {
                    Batch::final_batch(fragments)
                } else {
                    Batch::new(fragments)
                }
            })
            .collect();
        Ok(Box::new(Scripted {
            batches,
            result_dep: OUT,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Catalog and invocations
// ═══════════════════════════════════════════════════════════════════════════

/// Register every counter procedure.
pub fn register_procedures(catalog: &mut ProcedureCatalog) -> Result<(), CatalogError> {
    use ProcedureKind::{MultiPartition, SinglePartition};
    catalog.register(ProcedureInfo::new(INCREMENT, SinglePartition, false, Increment))?;
    catalog.register(ProcedureInfo::new(
        MP_INCREMENT,
        MultiPartition,
        false,
        MultiPartitionIncrement,
    ))?;
    catalog.register(ProcedureInfo::new(FAILING, SinglePartition, false, Failing))?;
    catalog.register(ProcedureInfo::new(
        FAILING_MP,
        MultiPartition,
        false,
        FailingMultiPartition,
    ))?;
    catalog.register(ProcedureInfo::new(CHAINED, MultiPartition, true, Chained))?;
    catalog.register(ProcedureInfo::new(READ_TOTAL, MultiPartition, true, ReadTotal))?;
    Ok(())
}

/// Catalog with the system procedures and every counter procedure.
pub fn build_catalog() -> Arc<ProcedureCatalog> {
    let mut catalog = ProcedureCatalog::with_system_procedures();
    register_procedures(&mut catalog).expect("counter procedure names are distinct");
    Arc::new(catalog)
}

fn ints(values: &[i64]) -> Parameters {
    values
        .iter()
        .fold(Parameters::new(), |params, v| params.with(ParamValue::Int(*v)))
}

pub fn increment(key: i64, delta: i64, client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(INCREMENT, ints(&[key, delta]), client_handle)
}

pub fn mp_increment(key: i64, delta: i64, client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(MP_INCREMENT, ints(&[key, delta]), client_handle)
}

pub fn failing(client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(FAILING, Parameters::new(), client_handle)
}

pub fn failing_mp(key: i64, client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(FAILING_MP, ints(&[key]), client_handle)
}

pub fn chained(batches: i64, client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(CHAINED, ints(&[batches]), client_handle)
}

pub fn read_total(key: i64, client_handle: u64) -> StoredProcedureInvocation {
    StoredProcedureInvocation::new(READ_TOTAL, ints(&[key]), client_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::{PartitionId, SiteId, TxnId};

    fn ctx() -> ProcedureContext {
        ProcedureContext {
            txn_id: TxnId(1),
            site_id: SiteId(1),
            partition_id: PartitionId(0),
            read_only: false,
            single_partition: false,
            num_partitions: 2,
        }
    }

    #[test]
    fn test_catalog_holds_every_procedure() {
        let catalog = build_catalog();
        for name in [INCREMENT, MP_INCREMENT, FAILING, FAILING_MP, CHAINED, READ_TOTAL] {
            assert!(catalog.get(name).is_some(), "{name} missing");
        }
        assert!(catalog.get(lockstep_core::sysproc::FINGERPRINT_PROCEDURE).is_some());
        assert!(catalog.get(READ_TOTAL).unwrap().read_only);
        assert!(catalog.get(MP_INCREMENT).unwrap().kind.is_multi_partition());
    }

    #[test]
    fn test_chained_issues_one_final_batch_last() {
        let catalog = build_catalog();
        let info = catalog.get(CHAINED).unwrap();
        let mut run = info.procedure.start(&ctx(), &ints(&[3])).unwrap();

        let mut finals = Vec::new();
        let mut previous = None;
        loop {
            match run.resume(previous.take()).unwrap() {
                ProcedureStep::Batch(batch) => {
                    batch.validate().unwrap();
                    finals.push(batch.is_final);
                    previous = Some(BatchResults::new());
                }
                ProcedureStep::Done(_) => break,
            }
        }
        assert_eq!(finals, vec![false, false, true]);
    }

    #[test]
    fn test_bad_parameters_are_rejected_at_start() {
        let catalog = build_catalog();
        let info = catalog.get(INCREMENT).unwrap();
        assert!(matches!(
            info.procedure.start(&ctx(), &Parameters::new()),
            Err(ProcedureError::InvalidParameters(_))
        ));
    }
}
