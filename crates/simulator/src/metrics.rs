//! Outcome counts, latency percentiles and the end-of-run report.

use crate::error::SimulatorError;
use hdrhistogram::Histogram;
use lockstep_simulation::{ClientOutcome, SimulationStats};
use lockstep_types::{PartitionId, ResponseStatus, SiteId, TxnId};
use std::collections::BTreeMap;
use std::time::Duration;

/// Significant figures kept by the latency histograms.
const SIGNIFICANT_FIGURES: u8 = 3;

/// Collects client outcomes as they are observed.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    single_partition: Histogram<u64>,
    multi_partition: Histogram<u64>,
    committed: u64,
    user_aborted: u64,
    failed: u64,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, SimulatorError> {
        Ok(Self {
            single_partition: Histogram::new(SIGNIFICANT_FIGURES)?,
            multi_partition: Histogram::new(SIGNIFICANT_FIGURES)?,
            committed: 0,
            user_aborted: 0,
            failed: 0,
        })
    }

    /// Record one finished request. Latency is kept in microseconds.
    pub fn record(&mut self, outcome: &ClientOutcome) {
        match outcome.response.status {
            ResponseStatus::Success => self.committed += 1,
            ResponseStatus::UserAbort => self.user_aborted += 1,
            ResponseStatus::GracefulFailure => self.failed += 1,
        }
        let micros = u64::try_from(outcome.latency().as_micros()).unwrap_or(u64::MAX);
        let histogram = if outcome.multi_partition {
            &mut self.multi_partition
        } else {
            &mut self.single_partition
        };
        histogram.saturating_record(micros);
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn user_aborted(&self) -> u64 {
        self.user_aborted
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn single_partition_latency(&self) -> LatencySummary {
        LatencySummary::from_histogram(&self.single_partition)
    }

    pub fn multi_partition_latency(&self) -> LatencySummary {
        LatencySummary::from_histogram(&self.multi_partition)
    }
}

/// Percentiles of one latency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencySummary {
    pub count: u64,
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            count: histogram.len(),
            p50: Duration::from_micros(histogram.value_at_quantile(0.50)),
            p99: Duration::from_micros(histogram.value_at_quantile(0.99)),
            max: Duration::from_micros(histogram.max()),
        }
    }
}

/// End state of one partition's surviving replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: PartitionId,
    /// Per live replica: transactions committed and short state fingerprint.
    pub replicas: BTreeMap<SiteId, (u64, String)>,
    pub last_committed: TxnId,
}

impl PartitionReport {
    /// Whether every live replica committed the same amount and holds the
    /// same state.
    pub fn replicas_agree(&self) -> bool {
        let mut states = self.replicas.values();
        match states.next() {
            Some(first) => states.all(|state| state == first),
            None => true,
        }
    }
}

/// Summary of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub seed: u64,
    /// Simulated time at the end of the run.
    pub elapsed: Duration,
    pub submitted: u64,
    pub committed: u64,
    pub user_aborted: u64,
    pub failed: u64,
    /// Requests whose coordinator or replicas died before answering.
    pub lost: u64,
    /// Whether every outstanding request finished before the drain timeout.
    pub drained: bool,
    pub single_partition_latency: LatencySummary,
    pub multi_partition_latency: LatencySummary,
    pub partitions: Vec<PartitionReport>,
    pub killed: Vec<SiteId>,
    /// Sites stopped by a fatal error, with the error.
    pub halted: BTreeMap<SiteId, String>,
    /// First divergence found between live replicas, if any.
    pub divergence: Option<String>,
    pub stats: SimulationStats,
}

impl SimulationReport {
    /// No divergence, no halted site, and every request accounted for.
    pub fn is_consistent(&self) -> bool {
        self.divergence.is_none()
            && self.halted.is_empty()
            && self.partitions.iter().all(PartitionReport::replicas_agree)
    }

    /// Committed transactions per simulated second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.committed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!("\n=== Simulation Report (seed {}) ===", self.seed);
        println!("Simulated time:  {:?}", self.elapsed);
        println!("Submitted:       {}", self.submitted);
        println!("Committed:       {}", self.committed);
        println!("User aborts:     {}", self.user_aborted);
        println!("Failed:          {}", self.failed);
        println!("Lost:            {}", self.lost);
        println!("Throughput:      {:.1} txn/s", self.throughput());
        if !self.drained {
            println!("WARNING: requests still outstanding at the drain timeout");
        }

        println!("\nLatency:");
        for (label, summary) in [
            ("single-partition", self.single_partition_latency),
            ("multi-partition", self.multi_partition_latency),
        ] {
            println!(
                "  {label:<17} n={:<6} p50={:?} p99={:?} max={:?}",
                summary.count, summary.p50, summary.p99, summary.max
            );
        }

        println!("\nPartitions:");
        for partition in &self.partitions {
            let verdict = if partition.replicas_agree() { "ok" } else { "DIVERGED" };
            println!(
                "  {} last_committed={} [{verdict}]",
                partition.partition, partition.last_committed
            );
            for (site, (commits, fingerprint)) in &partition.replicas {
                println!("    {site}: {commits} commits, state {fingerprint}");
            }
        }

        if !self.killed.is_empty() {
            println!("\nKilled: {:?}", self.killed);
        }
        for (site, error) in &self.halted {
            println!("HALTED {site}: {error}");
        }
        if let Some(divergence) = &self.divergence {
            println!("DIVERGENCE: {divergence}");
        }
        println!(
            "\nEvents: {}, messages sent: {}, dropped: {}",
            self.stats.events_processed, self.stats.messages_sent, self.stats.messages_dropped
        );
    }
}
