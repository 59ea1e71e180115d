//! The execution site: single-threaded owner of one partition replica.

use crate::fault::{FaultAgreement, FaultDiscovery};
use crate::{SiteConfig, SiteError, SiteStats};
use lockstep_core::{FragmentEngine, Mailbox, ProcedureCatalog};
use lockstep_messages::{
    CompleteTransactionMessage, Envelope, FailureSiteUpdateMessage, FragmentResponseMessage,
    FragmentTaskMessage, HeartbeatMessage, HeartbeatResponseMessage, InitiateTaskMessage,
    MultiPartitionParticipantMessage, SiteFailureFault, SiteMessage, Subject,
};
use lockstep_ordering::{InsertOutcome, RestrictedPriorityQueue};
use lockstep_txn::{
    decide_orphan_outcome, Decision, ExecutionContext, FaultImpact,
    MultiPartitionParticipantTxnState, Outbox, Outgoing, SinglePartitionTxnState, StepOutcome,
    TransactionState, TxnError,
};
use lockstep_types::{PartitionId, SiteId, Topology, TxnId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

/// One partition replica and everything it is working on.
///
/// The site admits initiator traffic into a [`RestrictedPriorityQueue`],
/// releases transactions one at a time in id order and drives the released
/// transaction until it finishes or blocks on another site. Only the idle wait
/// in [`run_loop`](Self::run_loop) ever suspends the thread.
pub struct ExecutionSite<M: Mailbox> {
    site_id: SiteId,
    partition_id: PartitionId,
    config: SiteConfig,
    topology: Arc<dyn Topology>,
    mailbox: M,
    engine: Box<dyn FragmentEngine>,
    catalog: Arc<ProcedureCatalog>,
    rpq: RestrictedPriorityQueue,
    transactions: BTreeMap<TxnId, TransactionState>,
    /// Released transaction being driven.
    current: Option<TxnId>,
    last_committed: TxnId,
    /// Newest multi-partition transaction known to have committed anywhere.
    globally_committed_mp: TxnId,
    failed_sites: BTreeSet<SiteId>,
    discovery: Option<FaultDiscovery>,
    outbox: Outbox,
    history: VecDeque<TxnId>,
    stats: SiteStats,
    shutdown: bool,
}

impl<M: Mailbox> ExecutionSite<M> {
    pub fn new(
        site_id: SiteId,
        topology: Arc<dyn Topology>,
        config: SiteConfig,
        mailbox: M,
        engine: Box<dyn FragmentEngine>,
        catalog: Arc<ProcedureCatalog>,
    ) -> Result<Self, SiteError> {
        let partition_id = topology
            .partition_for_site(site_id)
            .ok_or(SiteError::NotAnExecutionSite(site_id))?;
        let rpq = RestrictedPriorityQueue::new(
            topology.initiators().iter().copied(),
            config.replica_safety,
        );
        Ok(Self {
            site_id,
            partition_id,
            config,
            topology,
            mailbox,
            engine,
            catalog,
            rpq,
            transactions: BTreeMap::new(),
            current: None,
            last_committed: TxnId::NONE,
            globally_committed_mp: TxnId::NONE,
            failed_sites: BTreeSet::new(),
            discovery: None,
            outbox: Outbox::new(),
            history: VecDeque::new(),
            stats: SiteStats::default(),
            shutdown: false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn last_committed_txn_id(&self) -> TxnId {
        self.last_committed
    }

    pub fn globally_committed_mp_txn_id(&self) -> TxnId {
        self.globally_committed_mp
    }

    pub fn transaction(&self, txn_id: TxnId) -> Option<&TransactionState> {
        self.transactions.get(&txn_id)
    }

    /// Transactions the site holds state for.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn current_txn_id(&self) -> Option<TxnId> {
        self.current
    }

    /// Admitted transactions not yet released.
    pub fn pending_count(&self) -> usize {
        self.rpq.len()
    }

    pub fn queue(&self) -> &RestrictedPriorityQueue {
        &self.rpq
    }

    pub fn stats(&self) -> SiteStats {
        self.stats
    }

    /// Committed ids, oldest first, bounded by the configured limit.
    pub fn commit_history(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.history.iter().copied()
    }

    pub fn engine(&self) -> &dyn FragmentEngine {
        self.engine.as_ref()
    }

    pub fn failed_sites(&self) -> &BTreeSet<SiteId> {
        &self.failed_sites
    }

    pub fn in_fault_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn mailbox(&self) -> &M {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut M {
        &mut self.mailbox
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topology
    // ═══════════════════════════════════════════════════════════════════════

    /// Swap in an updated site-to-partition map.
    ///
    /// Survivor sets and fault agreements are computed against the new map
    /// from here on, and initiators it adds start blocking admission.
    /// Initiators it drops stay live until the fault protocol retires them.
    /// The site must keep its partition.
    pub fn update_topology(&mut self, topology: Arc<dyn Topology>) -> Result<(), SiteError> {
        match topology.partition_for_site(self.site_id) {
            None => return Err(SiteError::NotAnExecutionSite(self.site_id)),
            Some(partition) if partition != self.partition_id => {
                return Err(SiteError::PartitionReassigned {
                    site: self.site_id,
                    from: self.partition_id,
                    to: partition,
                });
            }
            Some(_) => {}
        }
        let mut joined = 0;
        for initiator in topology.initiators() {
            if self.rpq.add_initiator(*initiator) {
                joined += 1;
            }
        }
        info!(
            site = %self.site_id,
            partitions = topology.num_partitions(),
            execution_sites = topology.execution_sites().len(),
            joined,
            "Topology updated"
        );
        self.topology = topology;
        // Discovery in progress waits on the new survivor set.
        self.check_discovery()?;
        self.pump()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Run loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Process mail until poisoned or a fatal error.
    pub fn run_loop(&mut self) -> Result<(), SiteError> {
        info!(site = %self.site_id, partition = %self.partition_id, "Execution site started");
        let result = self.run_until_shutdown();
        match &result {
            Ok(()) => info!(
                site = %self.site_id,
                last_committed = %self.last_committed,
                committed = self.stats.committed,
                rolled_back = self.stats.rolled_back,
                "Execution site stopped"
            ),
            Err(e) => error!(site = %self.site_id, error = %e, "Execution site stopped on fatal error"),
        }
        result
    }

    fn run_until_shutdown(&mut self) -> Result<(), SiteError> {
        self.pump()?;
        while !self.shutdown {
            let Some(envelope) = self.mailbox.recv_blocking(self.config.idle_poll_interval) else {
                continue;
            };
            self.handle_message(envelope)?;
            self.pump()?;
            self.run_once()?;
        }
        Ok(())
    }

    /// Handle everything already in the mailbox without waiting.
    ///
    /// During fault discovery only fault traffic and poison are taken; the
    /// rest stays queued in the mailbox. Returns the number of messages
    /// handled.
    pub fn run_once(&mut self) -> Result<usize, SiteError> {
        let mut handled = 0;
        while !self.shutdown {
            let next = if self.discovery.is_some() {
                self.mailbox.recv_subject(&[Subject::Fault, Subject::Admin])
            } else {
                self.mailbox.recv()
            };
            let Some(envelope) = next else {
                break;
            };
            self.handle_message(envelope)?;
            self.pump()?;
            handled += 1;
        }
        self.pump()?;
        Ok(handled)
    }

    /// Release and drive transactions until one blocks or nothing is
    /// releasable.
    pub fn pump(&mut self) -> Result<(), SiteError> {
        while self.discovery.is_none() && !self.shutdown {
            let txn_id = match self.current {
                Some(txn_id) => txn_id,
                None => {
                    let Some(entry) = self.rpq.poll() else {
                        break;
                    };
                    if !self.transactions.contains_key(&entry.txn_id) {
                        warn!(site = %self.site_id, txn_id = %entry.txn_id, "Released transaction has no state");
                        continue;
                    }
                    trace!(site = %self.site_id, txn_id = %entry.txn_id, "Released");
                    self.current = Some(entry.txn_id);
                    entry.txn_id
                }
            };
            match self.recursable_run(txn_id) {
                Ok(StepOutcome::Blocked) => break,
                Ok(StepOutcome::Finished(_)) => {}
                Err(e) if e.is_fatal() => {
                    self.flush();
                    return Err(e);
                }
                Err(e) => {
                    warn!(site = %self.site_id, txn_id = %txn_id, error = %e, "Abandoning current transaction");
                    self.current = None;
                }
            }
        }
        self.flush();
        Ok(())
    }

    /// Drive one transaction as far as it can go.
    ///
    /// Single-partition work always finishes. Multi-partition work loops
    /// through as many batches as are locally satisfiable and blocks when it
    /// needs another site. Finished transactions are committed or rolled back
    /// here and leave the transaction map.
    #[instrument(skip(self), fields(site = %self.site_id))]
    pub fn recursable_run(&mut self, txn_id: TxnId) -> Result<StepOutcome, SiteError> {
        let globally_committed = self.globally_committed_mp;
        let state = self
            .transactions
            .get_mut(&txn_id)
            .ok_or(SiteError::UnknownTransaction(txn_id))?;
        let mut ctx = ExecutionContext::new(
            self.site_id,
            self.partition_id,
            self.topology.num_partitions(),
            self.config.max_batches_per_transaction,
            self.engine.as_mut(),
            &self.catalog,
            &mut self.outbox,
        );

        let mut orphan = false;
        let outcome = match state {
            TransactionState::SinglePartition(sp) => sp.run(&mut ctx),
            TransactionState::MultiPartition(mp) if mp.is_orphaned() => {
                orphan = true;
                mp.resolve_orphan(globally_committed)
            }
            TransactionState::MultiPartition(mp) => mp.step(&mut ctx)?,
        };
        self.stats.fragments_executed += ctx.fragments_executed;

        if let StepOutcome::Finished(decision) = outcome {
            if orphan {
                self.count_orphan(decision);
            }
            self.finish(txn_id, decision)?;
        }
        Ok(outcome)
    }

    /// Apply a final decision and forget the transaction.
    fn finish(&mut self, txn_id: TxnId, decision: Decision) -> Result<(), SiteError> {
        let Some(state) = self.transactions.remove(&txn_id) else {
            return Err(SiteError::UnknownTransaction(txn_id));
        };
        if self.current == Some(txn_id) {
            self.current = None;
        }
        match decision {
            Decision::Commit => {
                if txn_id <= self.last_committed {
                    error!(
                        site = %self.site_id,
                        txn_id = %txn_id,
                        last_committed = %self.last_committed,
                        "Out-of-order commit"
                    );
                    return Err(SiteError::OutOfOrderCommit {
                        txn_id,
                        last_committed: self.last_committed,
                    });
                }
                self.engine.commit(txn_id);
                self.last_committed = txn_id;
                if !state.is_single_partition() {
                    self.globally_committed_mp = self.globally_committed_mp.max(txn_id);
                }
                self.history.push_back(txn_id);
                while self.history.len() > self.config.commit_history_limit {
                    self.history.pop_front();
                }
                self.stats.committed += 1;
                debug!(site = %self.site_id, txn_id = %txn_id, "Committed");
            }
            Decision::Rollback => {
                self.engine.rollback(txn_id);
                self.stats.rolled_back += 1;
                debug!(site = %self.site_id, txn_id = %txn_id, "Rolled back");
            }
        }
        Ok(())
    }

    fn count_orphan(&mut self, decision: Decision) {
        match decision {
            Decision::Commit => self.stats.orphans_committed += 1,
            Decision::Rollback => self.stats.orphans_rolled_back += 1,
        }
    }

    fn flush(&mut self) {
        for Outgoing { to, message } in self.outbox.drain() {
            if self.failed_sites.contains(&to) {
                trace!(site = %self.site_id, to = %to, msg = message.type_name(), "Not sending to dead site");
                continue;
            }
            self.mailbox.send(to, message);
        }
    }

    fn drop_message(&mut self, txn_id: Option<TxnId>, reason: &'static str) {
        self.stats.messages_dropped += 1;
        debug!(site = %self.site_id, txn_id = ?txn_id, reason, "Dropped message");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle one delivered message.
    ///
    /// Only fatal errors are returned; anything else is logged and the
    /// message is dropped.
    #[instrument(skip(self, envelope), fields(site = %self.site_id, msg = envelope.message.type_name(), from = %envelope.source))]
    pub fn handle_message(&mut self, envelope: Envelope) -> Result<(), SiteError> {
        if self.failed_sites.contains(&envelope.source) {
            self.drop_message(envelope.message.txn_id(), "sender is dead");
            return Ok(());
        }
        if let Some(discovery) = self.discovery.as_mut() {
            let urgent = envelope.message.is_fault()
                || matches!(envelope.message, SiteMessage::Poison { .. });
            if !urgent {
                trace!(deferred = discovery.deferred_len() + 1, "Deferred during fault discovery");
                discovery.defer(envelope);
                return Ok(());
            }
        }

        self.stats.messages_handled += 1;
        let result = match envelope.message {
            SiteMessage::InitiateTask(task) => self.on_initiate_task(task),
            SiteMessage::MultiPartitionParticipant(notice) => self.on_participant_notice(notice),
            SiteMessage::Heartbeat(heartbeat) => self.on_heartbeat(heartbeat),
            SiteMessage::FragmentTask(task) => self.on_fragment_task(task),
            SiteMessage::FragmentResponse(response) => self.on_fragment_response(response),
            SiteMessage::CompleteTransaction(complete) => self.on_complete(complete),
            SiteMessage::SiteFailure(fault) => self.on_site_failure(fault),
            SiteMessage::FailureSiteUpdate(update) => self.on_failure_update(update),
            SiteMessage::Poison { reason } => {
                info!(site = %self.site_id, reason, "Poisoned, shutting down");
                self.shutdown = true;
                Ok(())
            }
            SiteMessage::InitiateResponse(_) | SiteMessage::HeartbeatResponse(_) => {
                warn!(site = %self.site_id, "Initiator-bound message delivered to a site");
                self.stats.messages_dropped += 1;
                Ok(())
            }
        };
        match result {
            Err(e) if !e.is_fatal() => {
                warn!(site = %self.site_id, error = %e, "Message rejected");
                self.stats.messages_dropped += 1;
            }
            Err(e) => {
                error!(site = %self.site_id, error = %e, "Fatal ordering violation");
                return Err(e);
            }
            Ok(()) => {}
        }
        self.flush();
        Ok(())
    }

    fn on_initiate_task(&mut self, task: InitiateTaskMessage) -> Result<(), SiteError> {
        let txn_id = task.txn_id;
        if task.coordinator_site_id != self.site_id {
            self.drop_message(Some(txn_id), "initiation addressed to another site");
            return Ok(());
        }
        if self.transactions.contains_key(&txn_id) {
            self.drop_message(Some(txn_id), "duplicate initiation");
            return Ok(());
        }
        match self.rpq.insert(txn_id, task.initiator_id, task.safe_txn_id)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                self.drop_message(Some(txn_id), "initiation already admitted");
                return Ok(());
            }
            InsertOutcome::Retired => {
                self.drop_message(Some(txn_id), "initiator retired");
                return Ok(());
            }
        }

        let state: TransactionState = if task.single_partition {
            SinglePartitionTxnState::new(task).into()
        } else {
            let mut coordinator = MultiPartitionParticipantTxnState::coordinator(task);
            if !self.failed_sites.is_empty() {
                coordinator.handle_site_faults(&self.failed_sites);
            }
            coordinator.into()
        };
        debug!(site = %self.site_id, txn_id = %txn_id, single_partition = state.is_single_partition(), "Admitted");
        self.transactions.insert(txn_id, state);
        Ok(())
    }

    fn on_participant_notice(
        &mut self,
        notice: MultiPartitionParticipantMessage,
    ) -> Result<(), SiteError> {
        let txn_id = notice.txn_id;
        let coordinator_dead = self.failed_sites.contains(&notice.coordinator_site_id);
        if coordinator_dead
            && decide_orphan_outcome(txn_id, self.globally_committed_mp) == Decision::Rollback
        {
            self.transactions.remove(&txn_id);
            self.drop_message(Some(txn_id), "coordinator is dead");
            return Ok(());
        }
        match self.rpq.insert(txn_id, notice.initiator_id, notice.safe_txn_id)? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                self.drop_message(Some(txn_id), "participant notice already admitted");
                return Ok(());
            }
            InsertOutcome::Retired => {
                self.transactions.remove(&txn_id);
                self.drop_message(Some(txn_id), "initiator retired");
                return Ok(());
            }
        }

        let entry = self
            .transactions
            .entry(txn_id)
            .or_insert_with(|| MultiPartitionParticipantTxnState::participant(&notice).into());
        let Some(participant) = entry.as_multi_partition_mut() else {
            return Err(TxnError::UnexpectedMessage {
                txn_id,
                message: "MultiPartitionParticipant",
            }
            .into());
        };
        participant.admit();
        if coordinator_dead {
            participant.handle_site_faults(&self.failed_sites);
        }
        debug!(site = %self.site_id, txn_id = %txn_id, "Admitted participant");
        Ok(())
    }

    fn on_heartbeat(&mut self, heartbeat: HeartbeatMessage) -> Result<(), SiteError> {
        self.rpq
            .note_advance(heartbeat.initiator_id, heartbeat.txn_id, heartbeat.safe_txn_id)?;
        let response = HeartbeatResponseMessage {
            site_id: self.site_id,
            initiator_id: heartbeat.initiator_id,
            last_received_txn_id: self
                .rpq
                .last_seen(heartbeat.initiator_id)
                .unwrap_or(TxnId::NONE),
            queue_state: self.rpq.state(),
        };
        self.outbox
            .send(heartbeat.initiator_id, SiteMessage::HeartbeatResponse(response));
        Ok(())
    }

    fn on_fragment_task(&mut self, task: FragmentTaskMessage) -> Result<(), SiteError> {
        let txn_id = task.txn_id;
        if let Some(state) = self.transactions.get_mut(&txn_id) {
            return match state.as_multi_partition_mut() {
                Some(participant) => Ok(participant.queue_task(task)?),
                None => Err(TxnError::UnexpectedMessage {
                    txn_id,
                    message: "FragmentTask",
                }
                .into()),
            };
        }

        if txn_id <= self.rpq.last_released() {
            self.drop_message(Some(txn_id), "fragment for a finished transaction");
            return Ok(());
        }
        if self.failed_sites.contains(&task.initiator_id) {
            self.drop_message(Some(txn_id), "fragment from a dead initiator's transaction");
            return Ok(());
        }
        trace!(site = %self.site_id, txn_id = %txn_id, "Fragment arrived before participant notice");
        let mut state = MultiPartitionParticipantTxnState::early(&task);
        state.queue_task(task)?;
        self.transactions.insert(txn_id, state.into());
        Ok(())
    }

    fn on_fragment_response(&mut self, response: FragmentResponseMessage) -> Result<(), SiteError> {
        let txn_id = response.txn_id;
        let recorded = match self
            .transactions
            .get_mut(&txn_id)
            .and_then(TransactionState::as_multi_partition_mut)
        {
            Some(coordinator) => coordinator.record_response(response)?,
            None => false,
        };
        if !recorded {
            self.drop_message(Some(txn_id), "stale fragment response");
        }
        Ok(())
    }

    fn on_complete(&mut self, complete: CompleteTransactionMessage) -> Result<(), SiteError> {
        let txn_id = complete.txn_id;
        if !complete.rollback {
            self.globally_committed_mp = self.globally_committed_mp.max(txn_id);
        }
        if let Some(state) = self.transactions.get_mut(&txn_id) {
            let Some(participant) = state.as_multi_partition_mut() else {
                return Err(TxnError::UnexpectedMessage {
                    txn_id,
                    message: "CompleteTransaction",
                }
                .into());
            };
            if participant.has_completion() {
                self.drop_message(Some(txn_id), "duplicate completion");
                return Ok(());
            }
            return Ok(participant.record_completion(complete)?);
        }

        if txn_id <= self.rpq.last_released() {
            self.drop_message(Some(txn_id), "completion for a finished transaction");
            return Ok(());
        }
        if self.failed_sites.contains(&complete.initiator_id) {
            self.drop_message(Some(txn_id), "completion for a dead initiator's transaction");
            return Ok(());
        }
        // The coordinator finished before issuing any batch and its decision
        // overtook the initiator's notice.
        trace!(site = %self.site_id, txn_id = %txn_id, "Completion arrived before participant notice");
        self.transactions.insert(
            txn_id,
            MultiPartitionParticipantTxnState::early_completion(complete).into(),
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fault protocol
    // ═══════════════════════════════════════════════════════════════════════

    fn on_site_failure(&mut self, fault: SiteFailureFault) -> Result<(), SiteError> {
        self.learn_failures(&fault.failed_site_ids);
        self.check_discovery()
    }

    fn on_failure_update(&mut self, update: FailureSiteUpdateMessage) -> Result<(), SiteError> {
        self.learn_failures(&update.failed_site_ids);
        if self.shutdown {
            return Ok(());
        }
        match self.discovery.as_mut() {
            Some(discovery) => {
                if !discovery.record(update) {
                    trace!(site = %self.site_id, "Report for a superseded failed set");
                }
            }
            None => trace!(site = %self.site_id, "Report after agreement"),
        }
        self.check_discovery()
    }

    /// Widen the failed set and restart discovery if anything is new.
    fn learn_failures(&mut self, reported: &BTreeSet<SiteId>) {
        let new: Vec<SiteId> = reported.difference(&self.failed_sites).copied().collect();
        if new.is_empty() {
            return;
        }
        if new.contains(&self.site_id) {
            warn!(site = %self.site_id, "This site was reported dead, shutting down");
            self.shutdown = true;
            return;
        }
        info!(site = %self.site_id, new = ?new, "Sites failed");
        self.failed_sites.extend(new);
        self.start_discovery();
    }

    fn start_discovery(&mut self) {
        let deferred = self
            .discovery
            .take()
            .map(FaultDiscovery::into_deferred)
            .unwrap_or_default();
        let mut discovery = FaultDiscovery::new(self.failed_sites.clone(), deferred);

        let initiator_safe_points = self
            .failed_sites
            .iter()
            .filter(|site| self.topology.is_initiator(**site))
            .map(|initiator| {
                let safe = self.rpq.safe_point(*initiator).unwrap_or(TxnId::NONE);
                (*initiator, safe)
            })
            .collect();
        let update = FailureSiteUpdateMessage {
            source_site_id: self.site_id,
            failed_site_ids: self.failed_sites.clone(),
            committed_mp_txn_id: self.globally_committed_mp,
            initiator_safe_points,
        };
        for survivor in self.topology.surviving_execution_sites(&self.failed_sites) {
            if survivor != self.site_id {
                self.outbox
                    .send(survivor, SiteMessage::FailureSiteUpdate(update.clone()));
            }
        }
        discovery.record(update);
        debug!(site = %self.site_id, failed = ?self.failed_sites, "Fault discovery started");
        self.discovery = Some(discovery);
    }

    /// Finish discovery once every survivor has reported.
    fn check_discovery(&mut self) -> Result<(), SiteError> {
        let survivors = self.topology.surviving_execution_sites(&self.failed_sites);
        let Some(discovery) = self.discovery.as_ref() else {
            return Ok(());
        };
        if !discovery.is_complete(&survivors) {
            trace!(
                site = %self.site_id,
                failed = ?discovery.failed(),
                missing = ?discovery.missing(&survivors).collect::<Vec<_>>(),
                "Waiting for fault reports"
            );
            return Ok(());
        }
        let agreement = discovery.agree(self.topology.as_ref(), self.partition_id);
        let deferred = self
            .discovery
            .take()
            .map(FaultDiscovery::into_deferred)
            .unwrap_or_default();

        self.apply_agreement(&agreement)?;
        self.stats.fault_agreements += 1;
        info!(
            site = %self.site_id,
            failed = ?agreement.failed,
            globally_committed = %self.globally_committed_mp,
            replaying = deferred.len(),
            "Fault agreement complete"
        );
        self.flush();
        for envelope in deferred {
            self.handle_message(envelope)?;
        }
        Ok(())
    }

    fn apply_agreement(&mut self, agreement: &FaultAgreement) -> Result<(), SiteError> {
        self.globally_committed_mp = self
            .globally_committed_mp
            .max(agreement.globally_committed);

        for (initiator, partition_safe) in &agreement.partition_safe {
            if !self.rpq.is_live_initiator(*initiator) {
                continue;
            }
            for txn_id in self.rpq.remove_initiator(*initiator, *partition_safe) {
                self.transactions.remove(&txn_id);
                debug!(site = %self.site_id, txn_id = %txn_id, "Dropped unsafe transaction of dead initiator");
            }
            let cluster_safe = agreement
                .cluster_safe
                .get(initiator)
                .copied()
                .unwrap_or(TxnId::NONE);
            let replica_safety = self.config.replica_safety;
            let doomed: Vec<TxnId> = self
                .transactions
                .iter()
                .filter(|(txn_id, state)| {
                    state.initiator_id() == *initiator
                        && !state.is_single_partition()
                        && (!state.is_admitted() || (replica_safety && **txn_id > cluster_safe))
                })
                .map(|(txn_id, _)| *txn_id)
                .collect();
            for txn_id in doomed {
                self.discard(txn_id);
            }
        }

        let multi_partition: Vec<TxnId> = self
            .transactions
            .iter()
            .filter(|(_, state)| !state.is_single_partition())
            .map(|(txn_id, _)| *txn_id)
            .collect();
        for txn_id in multi_partition {
            let is_current = self.current == Some(txn_id);
            let globally_committed = self.globally_committed_mp;
            let Some(state) = self
                .transactions
                .get_mut(&txn_id)
                .and_then(TransactionState::as_multi_partition_mut)
            else {
                continue;
            };
            match state.handle_site_faults(&agreement.failed) {
                FaultImpact::Orphaned if is_current => {
                    if let StepOutcome::Finished(decision) = state.resolve_orphan(globally_committed) {
                        self.count_orphan(decision);
                        self.finish(txn_id, decision)?;
                    }
                }
                FaultImpact::Orphaned => {
                    // Not started: nothing to undo. A commit is applied when
                    // the transaction is released.
                    if decide_orphan_outcome(txn_id, globally_committed) == Decision::Rollback {
                        self.rpq.remove(txn_id);
                        self.transactions.remove(&txn_id);
                        self.stats.orphans_rolled_back += 1;
                    }
                }
                FaultImpact::ParticipantsRemoved | FaultImpact::Unaffected => {}
            }
        }
        Ok(())
    }

    /// Drop a dead initiator's transaction, undoing any work it did here.
    fn discard(&mut self, txn_id: TxnId) {
        self.rpq.remove(txn_id);
        if self.transactions.remove(&txn_id).is_none() {
            return;
        }
        if self.current == Some(txn_id) {
            self.engine.rollback(txn_id);
            self.current = None;
            self.stats.rolled_back += 1;
        }
        debug!(site = %self.site_id, txn_id = %txn_id, "Discarded transaction of dead initiator");
    }
}
