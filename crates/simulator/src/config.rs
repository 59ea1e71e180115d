//! Configuration types for the simulator.

use crate::error::SimulatorError;
use lockstep_simulation::{InitiatorConfig, NetworkConfig, WorkloadConfig};
use lockstep_site::SiteConfig;
use lockstep_types::SiteId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A site to kill at a point in simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledKill {
    pub at: Duration,
    pub site: SiteId,
}

/// Configuration for a simulation run.
///
/// Every field has a default, so a TOML file only needs what it changes:
///
/// ```toml
/// seed = 7
/// duration = { secs = 10, nanos = 0 }
///
/// [network]
/// num_partitions = 4
/// replicas_per_partition = 3
///
/// [workload]
/// multi_partition_ratio = 0.4
///
/// [[kills]]
/// at = { secs = 3, nanos = 0 }
/// site = 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Cluster shape and link behavior.
    pub network: NetworkConfig,

    /// Applied to every execution site.
    pub site: SiteConfig,

    pub initiator: InitiatorConfig,

    /// Workload configuration.
    pub workload: WorkloadConfig,

    /// Random seed for deterministic simulation.
    pub seed: u64,

    /// How long the workload submits requests.
    pub duration: Duration,

    /// Extra simulated time allowed for outstanding requests to finish.
    pub drain_timeout: Duration,

    /// Sites to kill during the run.
    pub kills: Vec<ScheduledKill>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            site: SiteConfig::default(),
            initiator: InitiatorConfig::default(),
            workload: WorkloadConfig::default(),
            seed: 12345,
            duration: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
            kills: Vec::new(),
        }
    }
}

impl SimulatorConfig {
    /// Create a configuration with two initiators.
    pub fn new(num_partitions: u32, replicas_per_partition: u32) -> Self {
        Self {
            network: NetworkConfig::new(num_partitions, replicas_per_partition, 2),
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, SimulatorError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let text = std::fs::read_to_string(path).map_err(|source| SimulatorError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_site(mut self, site: SiteConfig) -> Self {
        self.site = site;
        self
    }

    pub fn with_initiator(mut self, initiator: InitiatorConfig) -> Self {
        self.initiator = initiator;
        self
    }

    /// Set the workload configuration.
    pub fn with_workload(mut self, workload: WorkloadConfig) -> Self {
        self.workload = workload;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Kill `site` at `at`.
    pub fn with_kill(mut self, at: Duration, site: SiteId) -> Self {
        self.kills.push(ScheduledKill { at, site });
        self
    }

    /// Total number of sites, execution sites and initiators.
    pub fn total_sites(&self) -> u32 {
        self.network.total_sites() + self.network.num_initiators
    }

    /// Reject kill targets that name no site.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        let last = u64::from(self.total_sites());
        for kill in &self.kills {
            if kill.site.0 == 0 || kill.site.0 > last {
                return Err(SimulatorError::InvalidConfig(format!(
                    "kill target {} is not a site (sites are 1..={last})",
                    kill.site
                )));
            }
        }
        if self.workload.batch_interval.is_zero() {
            return Err(SimulatorError::InvalidConfig(
                "workload.batch_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SimulatorConfig::from_toml(
            r#"
            seed = 7

            [network]
            num_partitions = 4
            replicas_per_partition = 3

            [workload]
            multi_partition_ratio = 0.4

            [[kills]]
            at = { secs = 3, nanos = 0 }
            site = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.network.num_partitions, 4);
        assert_eq!(config.network.replicas_per_partition, 3);
        assert_eq!(config.network.num_initiators, 2);
        assert_eq!(config.workload.multi_partition_ratio, 0.4);
        assert_eq!(config.workload.batch_size, WorkloadConfig::default().batch_size);
        assert_eq!(config.site, SiteConfig::default());
        assert_eq!(
            config.kills,
            vec![ScheduledKill {
                at: Duration::from_secs(3),
                site: SiteId(1)
            }]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_builders_match_the_equivalent_toml() {
        let built = SimulatorConfig::default()
            .with_network(NetworkConfig::new(3, 2, 1).with_latency(Duration::from_millis(2)))
            .with_site(SiteConfig::default().with_commit_history_limit(64))
            .with_initiator(
                InitiatorConfig::default().with_heartbeat_interval(Duration::from_millis(8)),
            )
            .with_workload(WorkloadConfig::default().with_key_space(16))
            .with_drain_timeout(Duration::from_secs(1));
        let parsed = SimulatorConfig::from_toml(
            r#"
            drain_timeout = { secs = 1, nanos = 0 }

            [network]
            num_partitions = 3
            replicas_per_partition = 2
            num_initiators = 1
            latency = { secs = 0, nanos = 2000000 }

            [site]
            commit_history_limit = 64

            [initiator]
            heartbeat_interval = { secs = 0, nanos = 8000000 }

            [workload]
            key_space = 16
            "#,
        )
        .unwrap();
        assert_eq!(parsed, built);
        assert_eq!(parsed.total_sites(), 7);
    }

    #[test]
    fn test_unknown_kill_target_is_rejected() {
        // 2 x 2 execution sites plus 2 initiators: sites 1..=6.
        let config = SimulatorConfig::new(2, 2).with_kill(Duration::ZERO, SiteId(7));
        assert!(matches!(
            config.validate(),
            Err(SimulatorError::InvalidConfig(_))
        ));
        assert!(SimulatorConfig::new(2, 2)
            .with_kill(Duration::ZERO, SiteId(6))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(matches!(
            SimulatorConfig::from_toml("seed = \"seven\""),
            Err(SimulatorError::ParseConfig(_))
        ));
    }
}
