//! Built-in system procedures.
//!
//! System fragments use ids from a reserved range at the top of the
//! `FragmentId` space and are answered by the site itself rather than by the
//! fragment library. [`execute_fragment`] is the single entry point sites use
//! to run any fragment; it routes reserved ids here and everything else to
//! the engine.

use crate::{
    Batch, BatchResults, DependencyInputs, FragmentEngine, FragmentError, PlannedFragment,
    Procedure, ProcedureContext, ProcedureError, ProcedureInfo, ProcedureKind, ProcedureRun,
    ProcedureStep,
};
use lockstep_types::{DependencyId, FragmentId, Parameters, Table, TxnId};

/// Name of the replica fingerprint procedure.
pub const FINGERPRINT_PROCEDURE: &str = "@Fingerprint";

/// Lowest reserved fragment id.
pub const SYSTEM_FRAGMENT_BASE: u64 = u64::MAX - 0xFFFF;

/// Returns the executing replica's state fingerprint as a one-row table.
pub const FINGERPRINT_FRAGMENT: FragmentId = FragmentId(SYSTEM_FRAGMENT_BASE + 1);

/// Check if a fragment id is in the reserved range.
pub fn is_system_fragment(fragment_id: FragmentId) -> bool {
    fragment_id.0 >= SYSTEM_FRAGMENT_BASE
}

/// Run a fragment, answering reserved ids locally.
pub fn execute_fragment(
    engine: &mut dyn FragmentEngine,
    txn_id: TxnId,
    fragment_id: FragmentId,
    params: &Parameters,
    inputs: &DependencyInputs,
    read_only: bool,
) -> Result<Table, FragmentError> {
    if !is_system_fragment(fragment_id) {
        return engine.execute_fragment(txn_id, fragment_id, params, inputs, read_only);
    }
    match fragment_id {
        FINGERPRINT_FRAGMENT => Ok(Table::from_rows(vec![engine
            .fingerprint()
            .as_bytes()
            .to_vec()])),
        other => Err(FragmentError::UnknownFragment(other)),
    }
}

/// Catalog entries for every built-in procedure.
pub fn system_procedures() -> Vec<ProcedureInfo> {
    vec![ProcedureInfo::new(
        FINGERPRINT_PROCEDURE,
        ProcedureKind::System,
        true,
        Fingerprint,
    )]
}

/// Collects one state fingerprint per partition.
struct Fingerprint;

struct FingerprintRun {
    issued: bool,
}

impl Procedure for Fingerprint {
    fn start(
        &self,
        _ctx: &ProcedureContext,
        _params: &Parameters,
    ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
        Ok(Box::new(FingerprintRun { issued: false }))
    }
}

impl ProcedureRun for FingerprintRun {
    fn resume(&mut self, previous: Option<BatchResults>) -> Result<ProcedureStep, ProcedureError> {
        if !self.issued {
            self.issued = true;
            return Ok(ProcedureStep::Batch(Batch::final_batch(vec![
                PlannedFragment::all_sites(FINGERPRINT_FRAGMENT, Parameters::new(), DependencyId(0)),
            ])));
        }
        let results = previous.unwrap_or_default();
        Ok(ProcedureStep::Done(results.tables(DependencyId(0)).to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateFingerprint;
    use lockstep_types::PartitionId;

    struct FixedEngine;

    impl FragmentEngine for FixedEngine {
        fn partition_id(&self) -> PartitionId {
            PartitionId(0)
        }

        fn execute_fragment(
            &mut self,
            _txn_id: TxnId,
            _fragment_id: FragmentId,
            _params: &Parameters,
            _inputs: &DependencyInputs,
            _read_only: bool,
        ) -> Result<Table, FragmentError> {
            Ok(Table::scalar(11))
        }

        fn commit(&mut self, _txn_id: TxnId) {}

        fn rollback(&mut self, _txn_id: TxnId) {}

        fn fingerprint(&self) -> StateFingerprint {
            StateFingerprint([7; 32])
        }
    }

    #[test]
    fn test_reserved_ids_are_answered_locally() {
        let mut engine = FixedEngine;
        let inputs = DependencyInputs::new();
        let table = execute_fragment(
            &mut engine,
            TxnId(1),
            FINGERPRINT_FRAGMENT,
            &Parameters::new(),
            &inputs,
            true,
        )
        .unwrap();
        assert_eq!(table.rows, vec![vec![7u8; 32]]);

        let user = execute_fragment(
            &mut engine,
            TxnId(1),
            FragmentId(3),
            &Parameters::new(),
            &inputs,
            false,
        )
        .unwrap();
        assert_eq!(user.as_scalar(), Some(11));

        assert_eq!(
            execute_fragment(
                &mut engine,
                TxnId(1),
                FragmentId(u64::MAX),
                &Parameters::new(),
                &inputs,
                true,
            ),
            Err(FragmentError::UnknownFragment(FragmentId(u64::MAX)))
        );
    }

    #[test]
    fn test_fingerprint_procedure_plans_one_final_batch() {
        let ctx = ProcedureContext {
            txn_id: TxnId(5),
            site_id: lockstep_types::SiteId(1),
            partition_id: PartitionId(0),
            read_only: true,
            single_partition: false,
            num_partitions: 2,
        };
        let mut run = Fingerprint.start(&ctx, &Parameters::new()).unwrap();
        let ProcedureStep::Batch(batch) = run.resume(None).unwrap() else {
            panic!("expected a batch");
        };
        assert!(batch.is_final);
        assert_eq!(batch.fragments[0].fragment_id, FINGERPRINT_FRAGMENT);

        let mut results = BatchResults::new();
        results.insert(
            DependencyId(0),
            vec![Table::from_rows(vec![vec![1; 32]]), Table::from_rows(vec![vec![2; 32]])],
        );
        assert_eq!(
            run.resume(Some(results)).unwrap(),
            ProcedureStep::Done(vec![
                Table::from_rows(vec![vec![1; 32]]),
                Table::from_rows(vec![vec![2; 32]]),
            ])
        );
    }
}
