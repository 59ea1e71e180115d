//! Client workload generation.

use lockstep_test_helpers::{
    counter_key, failing, failing_mp, increment, mp_increment, read_total,
};
use lockstep_types::{partition_for_key, PartitionId, StoredProcedureInvocation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Workload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Fraction of requests that span every partition.
    pub multi_partition_ratio: f64,

    /// Fraction of requests that are built to roll back.
    pub abort_ratio: f64,

    /// Fraction of multi-partition requests that only read.
    pub read_only_ratio: f64,

    /// Requests submitted per batch.
    pub batch_size: usize,

    /// Time between batches (simulated time).
    pub batch_interval: Duration,

    /// Counters are drawn from `0..key_space`.
    pub key_space: i64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            multi_partition_ratio: 0.2,
            abort_ratio: 0.05,
            read_only_ratio: 0.25,
            batch_size: 10,
            batch_interval: Duration::from_millis(20),
            key_space: 32,
        }
    }
}

impl WorkloadConfig {
    /// Single-partition increments only.
    pub fn single_partition_only() -> Self {
        Self {
            multi_partition_ratio: 0.0,
            ..Default::default()
        }
    }

    pub fn with_multi_partition_ratio(mut self, ratio: f64) -> Self {
        self.multi_partition_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_abort_ratio(mut self, ratio: f64) -> Self {
        self.abort_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_read_only_ratio(mut self, ratio: f64) -> Self {
        self.read_only_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_key_space(mut self, keys: i64) -> Self {
        self.key_space = keys.max(1);
        self
    }
}

/// Where a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    SinglePartition { partition: PartitionId },
    MultiPartition,
}

/// One client request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub invocation: StoredProcedureInvocation,
    pub kind: RequestKind,
    pub read_only: bool,
}

impl Request {
    pub fn single_partition(invocation: StoredProcedureInvocation, partition: PartitionId) -> Self {
        Self {
            invocation,
            kind: RequestKind::SinglePartition { partition },
            read_only: false,
        }
    }

    pub fn multi_partition(invocation: StoredProcedureInvocation, read_only: bool) -> Self {
        Self {
            invocation,
            kind: RequestKind::MultiPartition,
            read_only,
        }
    }

    pub fn is_multi_partition(&self) -> bool {
        self.kind == RequestKind::MultiPartition
    }
}

/// Trait for generating request workloads.
pub trait WorkloadGenerator {
    /// Generate a single request.
    fn generate_one(&mut self, rng: &mut impl Rng) -> Request;

    /// Requests per batch.
    fn batch_size(&self) -> usize;

    /// Generate a batch of requests.
    fn generate_batch(&mut self, rng: &mut impl Rng) -> Vec<Request> {
        (0..self.batch_size()).map(|_| self.generate_one(rng)).collect()
    }
}

/// Mixed counter workload over the sample procedures.
#[derive(Debug, Clone)]
pub struct CounterWorkload {
    config: WorkloadConfig,
    num_partitions: u32,
    next_handle: u64,
}

impl CounterWorkload {
    pub fn new(config: WorkloadConfig, num_partitions: u32) -> Self {
        Self {
            config,
            num_partitions,
            next_handle: 1,
        }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    fn handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl WorkloadGenerator for CounterWorkload {
    fn generate_one(&mut self, rng: &mut impl Rng) -> Request {
        let key = rng.gen_range(0..self.config.key_space.max(1));
        let delta = rng.gen_range(1..=5);
        let abort = rng.gen::<f64>() < self.config.abort_ratio;
        let handle = self.handle();

        if rng.gen::<f64>() < self.config.multi_partition_ratio {
            if abort {
                return Request::multi_partition(failing_mp(key, handle), false);
            }
            if rng.gen::<f64>() < self.config.read_only_ratio {
                return Request::multi_partition(read_total(key, handle), true);
            }
            return Request::multi_partition(mp_increment(key, delta, handle), false);
        }

        let partition = partition_for_key(&counter_key(key), self.num_partitions);
        let invocation = if abort {
            failing(handle)
        } else {
            increment(key, delta, handle)
        };
        Request::single_partition(invocation, partition)
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_test_helpers::{INCREMENT, MP_INCREMENT};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_ratios_are_honored() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let config = WorkloadConfig::single_partition_only()
            .with_abort_ratio(0.0)
            .with_batch_size(50);
        let mut workload = CounterWorkload::new(config, 4);
        let batch = workload.generate_batch(&mut rng);
        assert_eq!(batch.len(), 50);
        assert!(batch.iter().all(|r| !r.is_multi_partition()));
        assert!(batch.iter().all(|r| r.invocation.procedure == INCREMENT));

        let mut all_mp = CounterWorkload::new(
            WorkloadConfig::default()
                .with_multi_partition_ratio(1.0)
                .with_abort_ratio(0.0)
                .with_read_only_ratio(0.0),
            4,
        );
        let request = all_mp.generate_one(&mut rng);
        assert!(request.is_multi_partition());
        assert_eq!(request.invocation.procedure, MP_INCREMENT);
    }

    #[test]
    fn test_client_handles_are_unique() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut workload = CounterWorkload::new(WorkloadConfig::default(), 2);
        let handles: Vec<u64> = workload
            .generate_batch(&mut rng)
            .iter()
            .map(|r| r.invocation.client_handle)
            .collect();
        assert_eq!(handles, (1..=10).collect::<Vec<_>>());
    }
}
