//! Site and initiator failures.

use lockstep_simulation::{
    InitiatorConfig, NetworkConfig, Request, SimulationRunner, WorkloadConfig,
};
use lockstep_site::SiteConfig;
use lockstep_test_helpers::{chained, increment};
use lockstep_types::{PartitionId, ResponseStatus, SiteId};
use std::time::Duration;
use tracing_test::traced_test;

#[test]
fn test_killing_a_coordinator_leaves_survivors_consistent() {
    for seed in [3, 8] {
        let mut runner = SimulationRunner::new(NetworkConfig::new(2, 2, 2), seed).unwrap();
        runner.start_workload(
            WorkloadConfig::default()
                .with_multi_partition_ratio(0.5)
                .with_batch_size(4)
                .with_batch_interval(Duration::from_millis(10)),
            Duration::from_millis(300),
        );
        runner.schedule_kill(Duration::from_millis(120), SiteId(1));
        assert!(runner.run_until_quiet(Duration::from_secs(20)));

        assert!(!runner.is_alive(SiteId(1)));
        assert!(runner.halted_sites().is_empty());
        runner.check_replica_consistency().unwrap();
        let mut orphans = 0;
        for site in runner.sites().filter(|s| s.site_id() != SiteId(1)) {
            assert!(site.failed_sites().contains(&SiteId(1)));
            assert!(!site.in_fault_discovery());
            let stats = site.stats();
            assert!(stats.fault_agreements >= 1);
            orphans += stats.orphans_rolled_back + stats.orphans_committed;
        }
        // The victim was coordinating work when it died.
        assert!(orphans > 0, "seed {seed} resolved no orphans");
        // Partition 0 keeps committing on its surviving replica.
        let survivor = runner.site(SiteId(2)).unwrap();
        let victim = runner.site(SiteId(1)).unwrap();
        assert!(survivor.last_committed_txn_id() > victim.last_committed_txn_id());
    }
}

#[test]
fn test_batch_limit_is_reported_to_the_client() {
    let mut runner = SimulationRunner::with_configs(
        NetworkConfig::new(2, 1, 1),
        SiteConfig::default().with_max_batches_per_transaction(3),
        InitiatorConfig::default(),
        4,
    )
    .unwrap();
    let initiator = runner.topology().initiators()[0];
    let within = runner
        .submit(initiator, Request::multi_partition(chained(3, 1), true))
        .unwrap();
    let beyond = runner
        .submit(initiator, Request::multi_partition(chained(5, 2), true))
        .unwrap();
    assert!(runner.run_until_quiet(Duration::from_secs(5)));

    let outcome = |txn_id| runner.outcomes().find(|o| o.txn_id == txn_id).unwrap();
    assert!(outcome(within).response.is_success());
    let failed = outcome(beyond);
    assert_eq!(failed.response.status, ResponseStatus::GracefulFailure);
    assert!(failed
        .response
        .status_string
        .as_deref()
        .unwrap_or_default()
        .contains("3 batches"));
    runner.check_replica_consistency().unwrap();
}

#[test]
#[traced_test]
fn test_dead_initiator_stops_blocking_admission() {
    let config = NetworkConfig::new(2, 1, 2).with_fault_detection_delay(Duration::from_millis(40));
    let mut runner = SimulationRunner::new(config, 6).unwrap();
    let (live, dead) = {
        let initiators = runner.topology().initiators();
        (initiators[0], initiators[1])
    };
    runner.kill(dead);

    let txn_id = runner
        .submit(live, Request::single_partition(increment(3, 2, 1), PartitionId(0)))
        .unwrap();
    // The dead initiator never vouched for anything, so nothing is released.
    runner.run_for(Duration::from_millis(30));
    assert_eq!(runner.outcomes().count(), 0);

    assert!(runner.run_until_quiet(Duration::from_secs(2)));
    let outcome = runner.outcomes().next().unwrap();
    assert_eq!(outcome.txn_id, txn_id);
    assert!(outcome.response.is_success());
    assert!(outcome.completed_at >= Duration::from_millis(40));
    for site in runner.sites() {
        assert!(!site.queue().is_live_initiator(dead));
    }
    assert!(logs_contain("Fault agreement complete"));
}
