//! The simulation runner.

use crate::event_queue::{Event, EventPriority, EventQueue};
use crate::initiator::{ClientOutcome, InitiatorConfig, SimInitiator};
use crate::mailbox::SimMailbox;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::workload::{CounterWorkload, Request, RequestKind, WorkloadConfig, WorkloadGenerator};
use crate::SimulationError;
use lockstep_core::{FragmentEngine, StateFingerprint};
use lockstep_engine::MemoryEngine;
use lockstep_messages::{Envelope, SiteFailureFault, SiteMessage};
use lockstep_site::{ExecutionSite, SiteConfig, SiteError};
use lockstep_test_helpers::{build_catalog, build_library};
use lockstep_types::{PartitionId, SiteId, Topology, TxnId};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Source of simulated fault notices.
pub const FAULT_DETECTOR: SiteId = SiteId(0);

/// Seed offset separating the workload stream from the network stream.
const CLIENT_SEED_OFFSET: u64 = 0x5EED_C11E;

/// Running totals for a simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub transactions_submitted: u64,
    pub sites_killed: u64,
}

struct ActiveWorkload {
    generator: CounterWorkload,
    interval: Duration,
    until: Duration,
}

/// Deterministic cluster: every execution site and initiator on one thread,
/// driven by a time-ordered event queue.
pub struct SimulationRunner {
    config: NetworkConfig,
    initiator_config: InitiatorConfig,
    topology: Arc<dyn Topology>,
    queue: EventQueue,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    sites: BTreeMap<SiteId, ExecutionSite<SimMailbox>>,
    initiators: BTreeMap<SiteId, SimInitiator>,
    /// Sites stopped by a fatal error.
    halted: BTreeMap<SiteId, SiteError>,
    workload: Option<ActiveWorkload>,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Build a cluster with default site and initiator settings.
    pub fn new(config: NetworkConfig, seed: u64) -> Result<Self, SimulationError> {
        Self::with_configs(config, SiteConfig::default(), InitiatorConfig::default(), seed)
    }

    pub fn with_configs(
        config: NetworkConfig,
        site_config: SiteConfig,
        initiator_config: InitiatorConfig,
        seed: u64,
    ) -> Result<Self, SimulationError> {
        let topology: Arc<dyn Topology> = Arc::new(config.topology()?);
        let library = build_library();
        let catalog = build_catalog();

        let mut sites = BTreeMap::new();
        for site_id in topology.execution_sites() {
            let partition = topology
                .partition_for_site(*site_id)
                .ok_or(SiteError::NotAnExecutionSite(*site_id))?;
            let site = ExecutionSite::new(
                *site_id,
                Arc::clone(&topology),
                site_config.clone(),
                SimMailbox::new(*site_id),
                Box::new(MemoryEngine::new(partition, Arc::clone(&library))),
                Arc::clone(&catalog),
            )?;
            sites.insert(*site_id, site);
        }

        let mut initiators = BTreeMap::new();
        let mut queue = EventQueue::new();
        for (i, initiator_id) in topology.initiators().iter().enumerate() {
            initiators.insert(
                *initiator_id,
                SimInitiator::new(*initiator_id, Arc::clone(&topology))?,
            );
            // Stagger the first heartbeats so initiators don't tick in lockstep.
            let offset = Duration::from_micros(100 * i as u64);
            queue.schedule(offset, EventPriority::Timer, *initiator_id, Event::HeartbeatTimer);
        }

        info!(
            partitions = config.num_partitions,
            replicas = config.replicas_per_partition,
            initiators = config.num_initiators,
            seed,
            "Simulation cluster built"
        );
        Ok(Self {
            network: SimulatedNetwork::new(config.clone(), seed),
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(CLIENT_SEED_OFFSET)),
            config,
            initiator_config,
            topology,
            queue,
            sites,
            initiators,
            halted: BTreeMap::new(),
            workload: None,
            stats: SimulationStats::default(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn now(&self) -> Duration {
        self.queue.now()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn stats(&self) -> SimulationStats {
        let mut stats = self.stats;
        stats.messages_dropped += self.network.messages_dropped();
        stats
    }

    pub fn site(&self, site_id: SiteId) -> Option<&ExecutionSite<SimMailbox>> {
        self.sites.get(&site_id)
    }

    pub fn sites(&self) -> impl Iterator<Item = &ExecutionSite<SimMailbox>> {
        self.sites.values()
    }

    pub fn initiator(&self, initiator_id: SiteId) -> Option<&SimInitiator> {
        self.initiators.get(&initiator_id)
    }

    pub fn initiators(&self) -> impl Iterator<Item = &SimInitiator> {
        self.initiators.values()
    }

    pub fn is_alive(&self, site_id: SiteId) -> bool {
        self.network.is_alive(site_id) && !self.halted.contains_key(&site_id)
    }

    /// Sites stopped by fatal errors.
    pub fn halted_sites(&self) -> &BTreeMap<SiteId, SiteError> {
        &self.halted
    }

    /// Every finished client transaction, grouped by initiator.
    pub fn outcomes(&self) -> impl Iterator<Item = &ClientOutcome> {
        self.initiators.values().flat_map(|i| i.completed().iter())
    }

    /// Commit history of every live replica of a partition.
    pub fn replica_histories(&self, partition: PartitionId) -> Vec<(SiteId, Vec<TxnId>)> {
        self.live_replicas(partition)
            .map(|site| (site.site_id(), site.commit_history().collect()))
            .collect()
    }

    /// State fingerprint of every live replica of a partition.
    pub fn replica_fingerprints(&self, partition: PartitionId) -> Vec<(SiteId, StateFingerprint)> {
        self.live_replicas(partition)
            .map(|site| (site.site_id(), site.engine().fingerprint()))
            .collect()
    }

    fn live_replicas(&self, partition: PartitionId) -> impl Iterator<Item = &ExecutionSite<SimMailbox>> {
        self.topology
            .replicas_for_partition(partition)
            .iter()
            .filter(|site| self.is_alive(**site))
            .filter_map(|site| self.sites.get(site))
    }

    /// Check that live replicas of every partition committed the same
    /// transactions in the same order and hold the same data.
    ///
    /// Only meaningful once the cluster is quiet: a replica may lag.
    pub fn check_replica_consistency(&self) -> Result<(), SimulationError> {
        for p in 0..self.topology.num_partitions() {
            let partition = PartitionId(p);
            let histories = self.replica_histories(partition);
            if let Some((first_site, first)) = histories.first() {
                for (site, history) in &histories[1..] {
                    if history != first {
                        return Err(SimulationError::ReplicaDivergence {
                            partition,
                            detail: format!(
                                "{first_site} committed {} transactions, {site} committed {}",
                                first.len(),
                                history.len()
                            ),
                        });
                    }
                }
            }
            let fingerprints = self.replica_fingerprints(partition);
            if let Some((first_site, first)) = fingerprints.first() {
                for (site, fingerprint) in &fingerprints[1..] {
                    if fingerprint != first {
                        return Err(SimulationError::ReplicaDivergence {
                            partition,
                            detail: format!(
                                "{first_site} fingerprint {} != {site} fingerprint {}",
                                first.short(),
                                fingerprint.short()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether no live initiator is waiting on a transaction and the
    /// workload has finished submitting.
    pub fn is_quiet(&self) -> bool {
        let workload_done = self
            .workload
            .as_ref()
            .map_or(true, |w| self.now() >= w.until);
        workload_done
            && self
                .initiators
                .values()
                .filter(|i| i.is_alive())
                .all(|i| i.outstanding() == 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Driving
    // ═══════════════════════════════════════════════════════════════════════

    /// Submit one request through `initiator_id` now.
    pub fn submit(&mut self, initiator_id: SiteId, request: Request) -> Result<TxnId, SimulationError> {
        let now = self.now();
        let coordinator = match request.kind {
            RequestKind::MultiPartition => Some(self.pick_coordinator()?),
            RequestKind::SinglePartition { .. } => None,
        };
        let initiator = self
            .initiators
            .get_mut(&initiator_id)
            .ok_or(SimulationError::UnknownInitiator(initiator_id))?;
        if !initiator.is_alive() {
            return Err(SimulationError::DeadInitiator(initiator_id));
        }
        let submitted = match (request.kind, coordinator) {
            (RequestKind::SinglePartition { partition }, _) => initiator
                .submit_single_partition(now, partition, request.invocation, request.read_only)
                .ok_or(SimulationError::NoLiveReplica(partition)),
            (RequestKind::MultiPartition, Some(coordinator)) => initiator
                .submit_multi_partition(now, coordinator, request.invocation, request.read_only)
                .ok_or(SimulationError::NoLiveSites),
            (RequestKind::MultiPartition, None) => Err(SimulationError::NoLiveSites),
        };
        let txn_id = submitted?;
        let outgoing = initiator.take_outgoing();
        self.stats.transactions_submitted += 1;
        self.route(initiator_id, outgoing);
        Ok(txn_id)
    }

    /// Start submitting workload batches until `until`.
    pub fn start_workload(&mut self, config: WorkloadConfig, until: Duration) {
        let interval = config.batch_interval;
        self.workload = Some(ActiveWorkload {
            generator: CounterWorkload::new(config, self.topology.num_partitions()),
            interval,
            until,
        });
        let now = self.now();
        self.queue
            .schedule(now, EventPriority::Client, FAULT_DETECTOR, Event::WorkloadTimer);
    }

    /// Kill a site (execution site or initiator) now.
    pub fn kill(&mut self, site_id: SiteId) {
        if !self.network.kill(site_id) {
            return;
        }
        info!(site = %site_id, now = ?self.now(), "Killing site");
        self.stats.sites_killed += 1;
        if let Some(initiator) = self.initiators.get_mut(&site_id) {
            initiator.kill();
        }

        let failed: BTreeSet<SiteId> = [site_id].into_iter().collect();
        let now = self.now();
        let observers: Vec<SiteId> = self
            .sites
            .keys()
            .chain(self.initiators.keys())
            .copied()
            .filter(|id| self.network.is_alive(*id))
            .collect();
        for observer in observers {
            let at = now + self.network.detection_delay();
            self.queue.schedule(
                at,
                EventPriority::Fault,
                observer,
                Event::FaultDetected {
                    failed: failed.clone(),
                },
            );
        }
    }

    /// Kill a site at a future time.
    pub fn schedule_kill(&mut self, at: Duration, site_id: SiteId) {
        self.queue.schedule(at, EventPriority::Fault, site_id, Event::Kill);
    }

    /// Process every event up to and including `until`.
    pub fn run_until(&mut self, until: Duration) {
        while self.queue.peek_time().is_some_and(|t| t <= until) {
            self.step();
        }
        self.queue.advance_to(until);
    }

    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now() + duration;
        self.run_until(until);
    }

    /// Run until [`is_quiet`](Self::is_quiet) or `limit`. Returns whether the
    /// cluster went quiet.
    pub fn run_until_quiet(&mut self, limit: Duration) -> bool {
        loop {
            if self.is_quiet() {
                return true;
            }
            match self.queue.peek_time() {
                Some(t) if t <= limit => self.step(),
                _ => {
                    self.queue.advance_to(limit);
                    return self.is_quiet();
                }
            }
        }
    }

    fn step(&mut self) {
        let Some((key, event)) = self.queue.pop() else {
            return;
        };
        self.stats.events_processed += 1;
        match event {
            Event::Deliver(envelope) => self.deliver(key.node, envelope),
            Event::HeartbeatTimer => self.on_heartbeat_timer(key.node),
            Event::WorkloadTimer => self.on_workload_timer(),
            Event::FaultDetected { failed } => {
                let notice = SiteMessage::SiteFailure(SiteFailureFault::new(failed));
                self.deliver(key.node, Envelope::new(FAULT_DETECTOR, notice));
            }
            Event::Kill => self.kill(key.node),
        }
    }

    fn deliver(&mut self, to: SiteId, envelope: Envelope) {
        if !self.is_alive(to) {
            self.stats.messages_dropped += 1;
            return;
        }
        let now = self.now();
        let outgoing = if let Some(site) = self.sites.get_mut(&to) {
            if site.is_shutdown() {
                return;
            }
            site.mailbox_mut().deliver(envelope);
            let result = site.run_once();
            let outgoing = site.mailbox_mut().take_outgoing();
            if let Err(e) = result {
                error!(site = %to, error = %e, "Site halted");
                self.halted.insert(to, e);
            }
            outgoing
        } else if let Some(initiator) = self.initiators.get_mut(&to) {
            initiator.handle(now, envelope);
            initiator.take_outgoing()
        } else {
            debug!(to = %to, "Delivery to unknown node");
            return;
        };
        self.route(to, outgoing);
    }

    fn route(&mut self, from: SiteId, messages: Vec<(SiteId, SiteMessage)>) {
        let now = self.now();
        for (to, message) in messages {
            self.stats.messages_sent += 1;
            if let Some(at) = self.network.delivery_time(from, to, now) {
                self.queue.schedule(
                    at,
                    EventPriority::Delivery,
                    to,
                    Event::Deliver(Envelope::new(from, message)),
                );
            }
        }
    }

    fn on_heartbeat_timer(&mut self, initiator_id: SiteId) {
        let now = self.now();
        let Some(initiator) = self.initiators.get_mut(&initiator_id) else {
            return;
        };
        if !initiator.is_alive() {
            return;
        }
        initiator.heartbeat(now);
        let outgoing = initiator.take_outgoing();
        self.route(initiator_id, outgoing);
        self.queue.schedule(
            now + self.initiator_config.heartbeat_interval,
            EventPriority::Timer,
            initiator_id,
            Event::HeartbeatTimer,
        );
    }

    fn on_workload_timer(&mut self) {
        let now = self.now();
        let Some(workload) = self.workload.as_mut() else {
            return;
        };
        if now >= workload.until {
            return;
        }
        let requests = workload.generator.generate_batch(&mut self.rng);
        let next = now + workload.interval;
        for request in requests {
            let live: Vec<SiteId> = self
                .initiators
                .values()
                .filter(|i| i.is_alive())
                .map(SimInitiator::id)
                .collect();
            let Some(initiator_id) = live.choose(&mut self.rng).copied() else {
                return;
            };
            if let Err(e) = self.submit(initiator_id, request) {
                debug!(error = %e, "Request not submitted");
            }
        }
        if next < self.workload.as_ref().map_or(Duration::ZERO, |w| w.until) {
            self.queue
                .schedule(next, EventPriority::Client, FAULT_DETECTOR, Event::WorkloadTimer);
        }
    }

    fn pick_coordinator(&mut self) -> Result<SiteId, SimulationError> {
        let live: Vec<SiteId> = self
            .sites
            .keys()
            .copied()
            .filter(|id| self.is_alive(*id))
            .collect();
        live.choose(&mut self.rng)
            .copied()
            .ok_or(SimulationError::NoLiveSites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_test_helpers::{increment, mp_increment};
    use lockstep_types::ResponseStatus;

    #[test]
    fn test_single_request_commits_on_every_replica() {
        let mut runner = SimulationRunner::new(NetworkConfig::new(2, 2, 1), 11).unwrap();
        let initiator = runner.topology().initiators()[0];
        let txn_id = runner
            .submit(initiator, Request::single_partition(increment(1, 4, 1), PartitionId(1)))
            .unwrap();
        assert!(runner.run_until_quiet(Duration::from_secs(1)));

        for (_, history) in runner.replica_histories(PartitionId(1)) {
            assert_eq!(history, vec![txn_id]);
        }
        for (_, history) in runner.replica_histories(PartitionId(0)) {
            assert!(history.is_empty());
        }
        let outcome = runner.outcomes().next().unwrap();
        assert_eq!(outcome.txn_id, txn_id);
        assert_eq!(outcome.response.status, ResponseStatus::Success);
        runner.check_replica_consistency().unwrap();
    }

    #[test]
    fn test_multi_partition_request_sums_every_partition() {
        let mut runner = SimulationRunner::new(NetworkConfig::new(3, 1, 2), 5).unwrap();
        let initiator = runner.topology().initiators()[1];
        runner
            .submit(initiator, Request::multi_partition(mp_increment(2, 3, 1), false))
            .unwrap();
        assert!(runner.run_until_quiet(Duration::from_secs(1)));

        let outcome = runner.outcomes().next().unwrap();
        assert!(outcome.multi_partition);
        assert_eq!(outcome.response.results[0].as_scalar(), Some(9));
        for site in runner.sites() {
            assert_eq!(site.last_committed_txn_id(), outcome.txn_id);
        }
    }

    #[test]
    fn test_dead_initiator_is_rejected() {
        let mut runner = SimulationRunner::new(NetworkConfig::new(1, 1, 2), 1).unwrap();
        let dead = runner.topology().initiators()[0];
        runner.kill(dead);
        assert_eq!(
            runner.submit(dead, Request::single_partition(increment(1, 1, 1), PartitionId(0))),
            Err(SimulationError::DeadInitiator(dead))
        );
        assert_eq!(
            runner.submit(SiteId(99), Request::multi_partition(mp_increment(1, 1, 1), false)),
            Err(SimulationError::UnknownInitiator(SiteId(99)))
        );
    }
}
