//! Replicas of a partition stay identical under seeded interleavings.

use lockstep_core::{sysproc::FINGERPRINT_PROCEDURE, StateFingerprint};
use lockstep_simulation::{
    InitiatorConfig, NetworkConfig, Request, SimulationRunner, WorkloadConfig,
};
use lockstep_site::SiteConfig;
use lockstep_test_helpers::{chained, increment};
use lockstep_types::{Parameters, PartitionId, ResponseStatus, StoredProcedureInvocation, TxnId};
use std::time::Duration;

fn mixed_workload() -> WorkloadConfig {
    WorkloadConfig::default()
        .with_multi_partition_ratio(0.3)
        .with_abort_ratio(0.1)
        .with_batch_size(5)
        .with_batch_interval(Duration::from_millis(10))
}

fn run(seed: u64) -> SimulationRunner {
    let mut runner = SimulationRunner::new(NetworkConfig::new(2, 2, 2), seed).unwrap();
    runner.start_workload(mixed_workload(), Duration::from_millis(300));
    assert!(
        runner.run_until_quiet(Duration::from_secs(20)),
        "seed {seed} did not go quiet"
    );
    runner
}

#[test]
fn test_replicas_agree_under_mixed_workload() {
    for seed in [1, 2, 3, 17] {
        let runner = run(seed);
        runner.check_replica_consistency().unwrap();
        assert!(runner.halted_sites().is_empty());

        let submitted = runner.stats().transactions_submitted;
        assert!(submitted > 0);
        assert_eq!(runner.outcomes().count() as u64, submitted);
        assert!(runner
            .outcomes()
            .any(|o| o.response.status == ResponseStatus::Success));

        for p in 0..2 {
            let histories = runner.replica_histories(PartitionId(p));
            assert_eq!(histories.len(), 2);
            assert!(!histories[0].1.is_empty());
            assert!(histories[0].1.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

#[test]
fn test_same_seed_replays_identically() {
    let a = run(42);
    let b = run(42);
    for p in 0..2 {
        assert_eq!(
            a.replica_histories(PartitionId(p)),
            b.replica_histories(PartitionId(p))
        );
        assert_eq!(
            a.replica_fingerprints(PartitionId(p)),
            b.replica_fingerprints(PartitionId(p))
        );
    }
    let outcomes = |r: &SimulationRunner| -> Vec<(TxnId, ResponseStatus)> {
        r.outcomes().map(|o| (o.txn_id, o.response.status)).collect()
    };
    assert_eq!(outcomes(&a), outcomes(&b));
    assert_eq!(a.stats(), b.stats());
}

#[test]
fn test_fingerprint_procedure_reports_replica_state() {
    let mut runner = run(5);
    let initiator = runner.topology().initiators()[0];
    let fingerprint = StoredProcedureInvocation::new(FINGERPRINT_PROCEDURE, Parameters::new(), 10_000);
    let txn_id = runner
        .submit(initiator, Request::multi_partition(fingerprint, true))
        .unwrap();
    assert!(runner.run_until_quiet(Duration::from_secs(25)));

    let outcome = runner.outcomes().find(|o| o.txn_id == txn_id).unwrap();
    assert!(outcome.response.is_success());
    assert_eq!(outcome.response.results.len(), 2);
    for (p, table) in outcome.response.results.iter().enumerate() {
        let reported = StateFingerprint::from_row(&table.rows[0]).unwrap();
        for (_, actual) in runner.replica_fingerprints(PartitionId(p as u32)) {
            assert_eq!(reported, actual);
        }
    }
}

#[test]
fn test_batchless_multi_partition_txn_never_wedges_a_participant() {
    // With jitter the coordinator's decision can overtake the notice.
    for seed in 0..40 {
        let mut runner = SimulationRunner::with_configs(
            NetworkConfig::new(2, 1, 1).with_jitter(Duration::from_millis(30)),
            SiteConfig::default().with_replica_safety(false),
            InitiatorConfig::default(),
            seed,
        )
        .unwrap();
        let initiator = runner.topology().initiators()[0];
        let mp = runner
            .submit(initiator, Request::multi_partition(chained(0, 1), true))
            .unwrap();
        let sp = runner
            .submit(
                initiator,
                Request::single_partition(increment(1, 1, 2), PartitionId(1)),
            )
            .unwrap();
        assert!(
            runner.run_until_quiet(Duration::from_secs(5)),
            "seed {seed} did not go quiet"
        );
        runner.check_replica_consistency().unwrap();
        for txn_id in [mp, sp] {
            let outcome = runner.outcomes().find(|o| o.txn_id == txn_id).unwrap();
            assert!(outcome.response.is_success(), "seed {seed}");
        }
        for site in runner.sites() {
            assert_eq!(site.transaction_count(), 0, "seed {seed}");
        }
    }
}
