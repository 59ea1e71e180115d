//! Topology trait and static implementation.

use crate::{PartitionId, SiteId, MAX_INITIATOR_ID};
use std::collections::{BTreeMap, BTreeSet};

/// Compute which partition owns a key.
pub fn partition_for_key(key: &[u8], num_partitions: u32) -> PartitionId {
    let hash = blake3::hash(key);
    let bytes = hash.as_bytes();
    let hash_value = u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);
    PartitionId((hash_value % num_partitions.max(1) as u64) as u32)
}

/// Site-to-partition map supplied by the catalog layer.
///
/// Execution sites hold one partition replica each; initiators are separate
/// hosts that only issue transactions.
pub trait Topology: Send + Sync {
    /// Number of partitions in the cluster.
    fn num_partitions(&self) -> u32;

    /// All execution sites, in ascending id order.
    fn execution_sites(&self) -> &[SiteId];

    /// All initiators, in ascending id order.
    fn initiators(&self) -> &[SiteId];

    /// Partition a site holds a replica of.
    fn partition_for_site(&self, site: SiteId) -> Option<PartitionId>;

    /// Replica sites of a partition, in ascending id order.
    fn replicas_for_partition(&self, partition: PartitionId) -> &[SiteId];

    // Derived methods

    /// Check whether a site is an execution site.
    fn is_execution_site(&self, site: SiteId) -> bool {
        self.partition_for_site(site).is_some()
    }

    /// Check whether a site is an initiator.
    fn is_initiator(&self, site: SiteId) -> bool {
        self.initiators().binary_search(&site).is_ok()
    }

    /// Number of replicas of a partition.
    fn replication_factor(&self, partition: PartitionId) -> usize {
        self.replicas_for_partition(partition).len()
    }

    /// Non-coordinating participants of a multi-partition transaction
    /// coordinated by `coordinator`: every other execution site.
    fn multi_partition_participants(&self, coordinator: SiteId) -> Vec<SiteId> {
        self.execution_sites()
            .iter()
            .copied()
            .filter(|site| *site != coordinator)
            .collect()
    }

    /// Execution sites not in `failed`.
    fn surviving_execution_sites(&self, failed: &BTreeSet<SiteId>) -> Vec<SiteId> {
        self.execution_sites()
            .iter()
            .copied()
            .filter(|site| !failed.contains(site))
            .collect()
    }

    /// Partition that owns a key.
    fn partition_for_key(&self, key: &[u8]) -> PartitionId {
        partition_for_key(key, self.num_partitions())
    }
}

/// Errors that can occur when validating topology information.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A site appears more than once.
    #[error("site {0} is listed more than once")]
    DuplicateSite(SiteId),

    /// A partition has no replicas.
    #[error("partition {0} has no replicas")]
    EmptyPartition(PartitionId),

    /// Partition ids must be dense, starting at zero.
    #[error("partition ids must be 0..{expected}, found {found}")]
    SparsePartitions {
        /// Number of partitions declared.
        expected: u32,
        /// Offending partition.
        found: PartitionId,
    },

    /// An initiator id does not fit in a transaction id.
    #[error("initiator {0} is outside the transaction id range")]
    InitiatorOutOfRange(SiteId),
}

/// Fixed topology built once at startup.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    replicas: BTreeMap<PartitionId, Vec<SiteId>>,
    site_partition: BTreeMap<SiteId, PartitionId>,
    sites: Vec<SiteId>,
    initiators: Vec<SiteId>,
}

impl StaticTopology {
    /// Build a topology from an explicit partition map.
    pub fn new(
        partition_map: BTreeMap<PartitionId, Vec<SiteId>>,
        initiators: Vec<SiteId>,
    ) -> Result<Self, TopologyError> {
        let expected = partition_map.len() as u32;
        let mut seen = BTreeSet::new();
        let mut site_partition = BTreeMap::new();
        let mut replicas = BTreeMap::new();

        for (partition, sites) in partition_map {
            if partition.0 >= expected {
                return Err(TopologyError::SparsePartitions {
                    expected,
                    found: partition,
                });
            }
            if sites.is_empty() {
                return Err(TopologyError::EmptyPartition(partition));
            }
            let mut sorted = sites;
            sorted.sort();
            for site in &sorted {
                if !seen.insert(*site) {
                    return Err(TopologyError::DuplicateSite(*site));
                }
                site_partition.insert(*site, partition);
            }
            replicas.insert(partition, sorted);
        }

        let mut initiators = initiators;
        initiators.sort();
        for initiator in &initiators {
            if initiator.0 == 0 || initiator.0 > MAX_INITIATOR_ID {
                return Err(TopologyError::InitiatorOutOfRange(*initiator));
            }
            if !seen.insert(*initiator) {
                return Err(TopologyError::DuplicateSite(*initiator));
            }
        }

        let sites = site_partition.keys().copied().collect();
        Ok(Self {
            replicas,
            site_partition,
            sites,
            initiators,
        })
    }

    /// Build a uniform cluster.
    ///
    /// Execution sites are numbered from 1, partition-major (replica `r` of
    /// partition `p` is `1 + p * replicas + r`); initiators follow.
    pub fn uniform(
        num_partitions: u32,
        replicas_per_partition: u32,
        num_initiators: u32,
    ) -> Result<Self, TopologyError> {
        let mut map = BTreeMap::new();
        for p in 0..num_partitions {
            let sites = (0..replicas_per_partition)
                .map(|r| SiteId(1 + (p * replicas_per_partition + r) as u64))
                .collect();
            map.insert(PartitionId(p), sites);
        }
        let first_initiator = 1 + (num_partitions * replicas_per_partition) as u64;
        let initiators = (0..num_initiators as u64)
            .map(|i| SiteId(first_initiator + i))
            .collect();
        Self::new(map, initiators)
    }
}

impl Topology for StaticTopology {
    fn num_partitions(&self) -> u32 {
        self.replicas.len() as u32
    }

    fn execution_sites(&self) -> &[SiteId] {
        &self.sites
    }

    fn initiators(&self) -> &[SiteId] {
        &self.initiators
    }

    fn partition_for_site(&self, site: SiteId) -> Option<PartitionId> {
        self.site_partition.get(&site).copied()
    }

    fn replicas_for_partition(&self, partition: PartitionId) -> &[SiteId] {
        self.replicas
            .get(&partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
