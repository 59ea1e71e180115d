//! Drives one configured run and builds its report.

use crate::config::SimulatorConfig;
use crate::error::SimulatorError;
use crate::metrics::{MetricsCollector, PartitionReport, SimulationReport};
use lockstep_simulation::SimulationRunner;
use lockstep_types::{PartitionId, TxnId};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A configured simulation, ready to run once.
pub struct Simulator {
    config: SimulatorConfig,
    runner: SimulationRunner,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        config.validate()?;
        let runner = SimulationRunner::with_configs(
            config.network.clone(),
            config.site.clone(),
            config.initiator.clone(),
            config.seed,
        )?;
        Ok(Self { config, runner })
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// The underlying runner, for inspection after [`run`](Self::run).
    pub fn runner(&self) -> &SimulationRunner {
        &self.runner
    }

    /// Submit the workload for the configured duration, apply the kill
    /// schedule, then wait for outstanding requests up to the drain timeout.
    pub fn run(&mut self) -> Result<SimulationReport, SimulatorError> {
        let network = &self.config.network;
        info!(
            seed = self.config.seed,
            partitions = network.num_partitions,
            replicas = network.replicas_per_partition,
            initiators = network.num_initiators,
            duration = ?self.config.duration,
            "Starting simulation"
        );

        for kill in &self.config.kills {
            self.runner.schedule_kill(kill.at, kill.site);
        }
        self.runner
            .start_workload(self.config.workload.clone(), self.config.duration);
        self.runner.run_until(self.config.duration);

        let limit = self.config.duration + self.config.drain_timeout;
        let drained = self.runner.run_until_quiet(limit);
        if !drained {
            warn!(now = ?self.runner.now(), "Drain timeout reached with requests outstanding");
        }

        let report = self.report(drained)?;
        info!(
            committed = report.committed,
            lost = report.lost,
            consistent = report.is_consistent(),
            "Simulation finished"
        );
        Ok(report)
    }

    fn report(&self, drained: bool) -> Result<SimulationReport, SimulatorError> {
        let runner = &self.runner;
        let mut metrics = MetricsCollector::new()?;
        for outcome in runner.outcomes() {
            metrics.record(outcome);
        }

        let partitions = (0..runner.topology().num_partitions())
            .map(|p| self.partition_report(PartitionId(p)))
            .collect();
        let killed = runner
            .topology()
            .execution_sites()
            .iter()
            .chain(runner.topology().initiators())
            .copied()
            .filter(|site| !runner.is_alive(*site))
            .collect();
        let halted = runner
            .halted_sites()
            .iter()
            .map(|(site, error)| (*site, error.to_string()))
            .collect();

        let stats = runner.stats();
        Ok(SimulationReport {
            seed: self.config.seed,
            elapsed: runner.now(),
            submitted: stats.transactions_submitted,
            committed: metrics.committed(),
            user_aborted: metrics.user_aborted(),
            failed: metrics.failed(),
            lost: runner.initiators().map(|i| i.lost().len() as u64).sum(),
            drained,
            single_partition_latency: metrics.single_partition_latency(),
            multi_partition_latency: metrics.multi_partition_latency(),
            partitions,
            killed,
            halted,
            divergence: runner
                .check_replica_consistency()
                .err()
                .map(|e| e.to_string()),
            stats,
        })
    }

    fn partition_report(&self, partition: PartitionId) -> PartitionReport {
        let runner = &self.runner;
        let fingerprints: BTreeMap<_, _> = runner.replica_fingerprints(partition).into_iter().collect();
        let mut replicas = BTreeMap::new();
        let mut last_committed = TxnId::NONE;
        for (site_id, fingerprint) in fingerprints {
            if let Some(site) = runner.site(site_id) {
                last_committed = last_committed.max(site.last_committed_txn_id());
                replicas.insert(site_id, (site.stats().committed, fingerprint.short()));
            }
        }
        PartitionReport {
            partition,
            replicas,
            last_committed,
        }
    }
}
