//! Simulated initiators.
//!
//! An initiator assigns transaction ids, fans each request out to the sites
//! that must run it, and heartbeats every execution site so the sites'
//! admission queues keep moving when it has nothing to send. The safe id it
//! attaches to each message is the newest id every live replica of the
//! destination's partition has acknowledged receiving.

use crate::SimulationError;
use lockstep_messages::{Envelope, HeartbeatMessage, InitiateTaskMessage, SiteMessage};
use lockstep_types::{
    ClientResponse, PartitionId, SiteId, StoredProcedureInvocation, Topology, TxnId,
    TxnIdGenerator,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Initiator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Time between heartbeats to every execution site.
    pub heartbeat_interval: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5),
        }
    }
}

impl InitiatorConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// What a client learned about one finished transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOutcome {
    pub txn_id: TxnId,
    pub client_handle: u64,
    pub multi_partition: bool,
    pub submitted_at: Duration,
    pub completed_at: Duration,
    pub response: ClientResponse,
}

impl ClientOutcome {
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_sub(self.submitted_at)
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    client_handle: u64,
    submitted_at: Duration,
    /// Coordinator of a multi-partition transaction.
    coordinator: Option<SiteId>,
    /// Partition of a single-partition transaction.
    partition: Option<PartitionId>,
}

/// One simulated initiator.
pub struct SimInitiator {
    id: SiteId,
    topology: Arc<dyn Topology>,
    generator: TxnIdGenerator,
    live_sites: BTreeSet<SiteId>,
    /// Newest id each site reported receiving from this initiator.
    acked: BTreeMap<SiteId, TxnId>,
    outstanding: BTreeMap<TxnId, Outstanding>,
    completed: Vec<ClientOutcome>,
    /// Transactions whose outcome the client will never hear.
    lost: Vec<TxnId>,
    outgoing: Vec<(SiteId, SiteMessage)>,
    alive: bool,
}

impl SimInitiator {
    pub fn new(id: SiteId, topology: Arc<dyn Topology>) -> Result<Self, SimulationError> {
        let generator = TxnIdGenerator::new(id)?;
        let live_sites = topology.execution_sites().iter().copied().collect();
        Ok(Self {
            id,
            topology,
            generator,
            live_sites,
            acked: BTreeMap::new(),
            outstanding: BTreeMap::new(),
            completed: Vec::new(),
            lost: Vec::new(),
            outgoing: Vec::new(),
            alive: true,
        })
    }

    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn kill(&mut self) {
        self.alive = false;
    }

    /// Finished transactions, in completion order.
    pub fn completed(&self) -> &[ClientOutcome] {
        &self.completed
    }

    pub fn lost(&self) -> &[TxnId] {
        &self.lost
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn last_issued(&self) -> TxnId {
        self.generator.last_issued()
    }

    /// Everything queued for sending since the last call.
    pub fn take_outgoing(&mut self) -> Vec<(SiteId, SiteMessage)> {
        std::mem::take(&mut self.outgoing)
    }

    fn live_replicas(&self, partition: PartitionId) -> Vec<SiteId> {
        self.topology
            .replicas_for_partition(partition)
            .iter()
            .copied()
            .filter(|site| self.live_sites.contains(site))
            .collect()
    }

    /// Newest id every live replica of `partition` has acknowledged.
    pub fn safe_txn_id(&self, partition: PartitionId) -> TxnId {
        self.live_replicas(partition)
            .iter()
            .map(|site| self.acked.get(site).copied().unwrap_or(TxnId::NONE))
            .min()
            .unwrap_or(TxnId::NONE)
    }

    fn safe_for_site(&self, site: SiteId) -> TxnId {
        self.topology
            .partition_for_site(site)
            .map_or(TxnId::NONE, |partition| self.safe_txn_id(partition))
    }

    /// Send a single-partition request to every live replica of `partition`.
    ///
    /// Returns `None` when no replica is alive.
    pub fn submit_single_partition(
        &mut self,
        now: Duration,
        partition: PartitionId,
        invocation: StoredProcedureInvocation,
        read_only: bool,
    ) -> Option<TxnId> {
        let replicas = self.live_replicas(partition);
        if !self.alive || replicas.is_empty() {
            return None;
        }
        let txn_id = self.generator.next(now);
        let safe = self.safe_txn_id(partition);
        for replica in &replicas {
            let task = InitiateTaskMessage::single_partition(
                self.id,
                *replica,
                txn_id,
                read_only,
                invocation.clone(),
                safe,
            );
            self.outgoing
                .push((*replica, SiteMessage::InitiateTask(task)));
        }
        trace!(initiator = %self.id, txn_id = %txn_id, partition = %partition, "Submitted");
        self.outstanding.insert(
            txn_id,
            Outstanding {
                client_handle: invocation.client_handle,
                submitted_at: now,
                coordinator: None,
                partition: Some(partition),
            },
        );
        Some(txn_id)
    }

    /// Send a multi-partition request coordinated by `coordinator`. Every
    /// other live execution site gets a participant notice.
    pub fn submit_multi_partition(
        &mut self,
        now: Duration,
        coordinator: SiteId,
        invocation: StoredProcedureInvocation,
        read_only: bool,
    ) -> Option<TxnId> {
        if !self.alive || !self.live_sites.contains(&coordinator) {
            return None;
        }
        let txn_id = self.generator.next(now);
        let client_handle = invocation.client_handle;
        let participants: Vec<SiteId> = self.live_sites.iter().copied().collect();
        let task = InitiateTaskMessage::multi_partition(
            self.id,
            coordinator,
            txn_id,
            read_only,
            invocation,
            self.safe_for_site(coordinator),
            participants.clone(),
        );
        for site in participants.iter().filter(|s| **s != coordinator) {
            let notice = task.participant_notice(self.safe_for_site(*site));
            self.outgoing
                .push((*site, SiteMessage::MultiPartitionParticipant(notice)));
        }
        self.outgoing
            .push((coordinator, SiteMessage::InitiateTask(task)));
        trace!(initiator = %self.id, txn_id = %txn_id, coordinator = %coordinator, "Submitted");
        self.outstanding.insert(
            txn_id,
            Outstanding {
                client_handle,
                submitted_at: now,
                coordinator: Some(coordinator),
                partition: None,
            },
        );
        Some(txn_id)
    }

    /// Heartbeat every live execution site with a fresh id.
    pub fn heartbeat(&mut self, now: Duration) {
        if !self.alive {
            return;
        }
        let txn_id = self.generator.next(now);
        let sites: Vec<SiteId> = self.live_sites.iter().copied().collect();
        for site in sites {
            let heartbeat = HeartbeatMessage {
                initiator_id: self.id,
                txn_id,
                safe_txn_id: self.safe_for_site(site),
            };
            self.outgoing.push((site, SiteMessage::Heartbeat(heartbeat)));
        }
    }

    /// Handle a message addressed to this initiator.
    pub fn handle(&mut self, now: Duration, envelope: Envelope) {
        if !self.alive {
            return;
        }
        match envelope.message {
            SiteMessage::InitiateResponse(response) => {
                // Replicas of a single-partition transaction each answer;
                // the first one wins.
                let Some(outstanding) = self.outstanding.remove(&response.txn_id) else {
                    return;
                };
                self.completed.push(ClientOutcome {
                    txn_id: response.txn_id,
                    client_handle: outstanding.client_handle,
                    multi_partition: outstanding.coordinator.is_some(),
                    submitted_at: outstanding.submitted_at,
                    completed_at: now,
                    response: response.response,
                });
            }
            SiteMessage::HeartbeatResponse(response) => {
                let acked = self.acked.entry(response.site_id).or_default();
                *acked = (*acked).max(response.last_received_txn_id);
            }
            SiteMessage::SiteFailure(fault) => self.on_failures(&fault.failed_site_ids),
            other => trace!(initiator = %self.id, msg = other.type_name(), "Ignoring"),
        }
    }

    fn on_failures(&mut self, failed: &BTreeSet<SiteId>) {
        if failed.contains(&self.id) {
            self.alive = false;
            return;
        }
        for site in failed {
            self.live_sites.remove(site);
            self.acked.remove(site);
        }
        let doomed: Vec<TxnId> = self
            .outstanding
            .iter()
            .filter(|(_, o)| match (o.coordinator, o.partition) {
                (Some(coordinator), _) => failed.contains(&coordinator),
                (None, Some(partition)) => self.live_replicas(partition).is_empty(),
                (None, None) => false,
            })
            .map(|(txn_id, _)| *txn_id)
            .collect();
        for txn_id in doomed {
            self.outstanding.remove(&txn_id);
            debug!(initiator = %self.id, txn_id = %txn_id, "Outcome lost with its coordinator");
            self.lost.push(txn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_messages::{HeartbeatResponseMessage, QueueState, SiteFailureFault};
    use lockstep_test_helpers::{increment, mp_increment};
    use lockstep_types::StaticTopology;

    fn initiator() -> SimInitiator {
        // Partitions 0 = {1, 2}, 1 = {3, 4}; initiator 5.
        let topology: Arc<dyn Topology> = Arc::new(StaticTopology::uniform(2, 2, 1).unwrap());
        SimInitiator::new(SiteId(5), topology).unwrap()
    }

    fn ack(site: u64, txn_id: TxnId) -> Envelope {
        Envelope::new(
            SiteId(site),
            SiteMessage::HeartbeatResponse(HeartbeatResponseMessage {
                site_id: SiteId(site),
                initiator_id: SiteId(5),
                last_received_txn_id: txn_id,
                queue_state: QueueState::BlockedEmpty,
            }),
        )
    }

    #[test]
    fn test_safe_id_is_minimum_over_live_replicas() {
        let mut init = initiator();
        let now = Duration::from_millis(1);
        init.handle(now, ack(1, TxnId(500)));
        assert_eq!(init.safe_txn_id(PartitionId(0)), TxnId::NONE);
        init.handle(now, ack(2, TxnId(300)));
        assert_eq!(init.safe_txn_id(PartitionId(0)), TxnId(300));

        // A dead replica no longer holds the partition back.
        init.handle(
            now,
            Envelope::new(SiteId(0), SiteMessage::SiteFailure(SiteFailureFault::new([SiteId(2)]))),
        );
        assert_eq!(init.safe_txn_id(PartitionId(0)), TxnId(500));
    }

    #[test]
    fn test_single_partition_goes_to_every_replica() {
        let mut init = initiator();
        let txn_id = init
            .submit_single_partition(Duration::from_millis(3), PartitionId(1), increment(1, 1, 9), false)
            .unwrap();
        let sent = init.take_outgoing();
        let targets: Vec<SiteId> = sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![SiteId(3), SiteId(4)]);
        assert_eq!(init.outstanding(), 1);
        assert_eq!(init.last_issued(), txn_id);
    }

    #[test]
    fn test_multi_partition_notifies_every_other_site_and_loses_dead_coordinator() {
        let mut init = initiator();
        let txn_id = init
            .submit_multi_partition(Duration::from_millis(3), SiteId(2), mp_increment(1, 1, 9), false)
            .unwrap();
        let sent = init.take_outgoing();
        assert_eq!(sent.len(), 4);
        let notices = sent
            .iter()
            .filter(|(_, m)| matches!(m, SiteMessage::MultiPartitionParticipant(_)))
            .count();
        assert_eq!(notices, 3);

        init.handle(
            Duration::from_millis(9),
            Envelope::new(SiteId(0), SiteMessage::SiteFailure(SiteFailureFault::new([SiteId(2)]))),
        );
        assert_eq!(init.outstanding(), 0);
        assert_eq!(init.lost(), &[txn_id]);
        assert!(init
            .submit_multi_partition(Duration::from_millis(10), SiteId(2), mp_increment(1, 1, 10), false)
            .is_none());
    }
}
