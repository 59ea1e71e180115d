//! Simulated network with seeded latency and site kills.

use lockstep_types::{SiteId, StaticTopology, TopologyError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::trace;

/// Shape of the simulated cluster and its links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub num_partitions: u32,
    pub replicas_per_partition: u32,
    pub num_initiators: u32,

    /// Base one-way latency of every link.
    pub latency: Duration,

    /// Upper bound of the random delay added to each message.
    pub jitter: Duration,

    /// How long after a kill survivors are told about it.
    pub fault_detection_delay: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_partitions: 2,
            replicas_per_partition: 2,
            num_initiators: 2,
            latency: Duration::from_millis(1),
            jitter: Duration::from_millis(3),
            fault_detection_delay: Duration::from_millis(50),
        }
    }
}

impl NetworkConfig {
    pub fn new(num_partitions: u32, replicas_per_partition: u32, num_initiators: u32) -> Self {
        Self {
            num_partitions,
            replicas_per_partition,
            num_initiators,
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_fault_detection_delay(mut self, delay: Duration) -> Self {
        self.fault_detection_delay = delay;
        self
    }

    /// Total number of execution sites.
    pub fn total_sites(&self) -> u32 {
        self.num_partitions * self.replicas_per_partition
    }

    /// The uniform topology this network simulates.
    pub fn topology(&self) -> Result<StaticTopology, TopologyError> {
        StaticTopology::uniform(
            self.num_partitions,
            self.replicas_per_partition,
            self.num_initiators,
        )
    }
}

/// Decides when, and whether, each message arrives.
///
/// Every message gets `latency + U[0, jitter]`, but never arrives before an
/// earlier message on the same link, so each sender-receiver pair is FIFO.
/// Traffic to or from a killed site is dropped.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    dead: BTreeSet<SiteId>,
    link_clock: BTreeMap<(SiteId, SiteId), Duration>,
    dropped: u64,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            dead: BTreeSet::new(),
            link_clock: BTreeMap::new(),
            dropped: 0,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Arrival time of a message sent now, or `None` if it is lost.
    pub fn delivery_time(&mut self, from: SiteId, to: SiteId, now: Duration) -> Option<Duration> {
        if self.dead.contains(&from) || self.dead.contains(&to) {
            self.dropped += 1;
            trace!(from = %from, to = %to, "Dropping message on dead link");
            return None;
        }
        let jitter_nanos = u64::try_from(self.config.jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.rng.gen_range(0..=jitter_nanos))
        };
        let link = self.link_clock.entry((from, to)).or_default();
        let at = (now + self.config.latency + jitter).max(*link);
        *link = at;
        Some(at)
    }

    /// Extra delay before a survivor notices a death, for staggering.
    pub fn detection_delay(&mut self) -> Duration {
        let base = self.config.fault_detection_delay;
        let spread = u64::try_from(self.config.jitter.as_nanos()).unwrap_or(u64::MAX);
        if spread == 0 {
            base
        } else {
            base + Duration::from_nanos(self.rng.gen_range(0..=spread))
        }
    }

    /// Kill a site. Returns false if it was already dead.
    pub fn kill(&mut self, site: SiteId) -> bool {
        self.dead.insert(site)
    }

    pub fn is_alive(&self, site: SiteId) -> bool {
        !self.dead.contains(&site)
    }

    /// Messages lost to dead links.
    pub fn messages_dropped(&self) -> u64 {
        self.dropped
    }
}
