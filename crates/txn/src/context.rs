//! What a transaction step may touch.

use lockstep_core::{sysproc, DependencyInputs, FragmentEngine, FragmentError, ProcedureCatalog};
use lockstep_messages::SiteMessage;
use lockstep_types::{FragmentId, Parameters, PartitionId, SiteId, Table, TxnId};

/// A message a step wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SiteId,
    pub message: SiteMessage,
}

/// Messages produced by transaction steps, flushed by the site afterwards.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    messages: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: SiteId, message: SiteMessage) {
        self.messages.push(Outgoing { to, message });
    }

    pub fn send_many<'a>(&mut self, to: impl IntoIterator<Item = &'a SiteId>, message: SiteMessage) {
        for site in to {
            self.send(*site, message.clone());
        }
    }

    /// Take everything queued so far, in send order.
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Site resources lent to one transaction step.
pub struct ExecutionContext<'a> {
    pub site_id: SiteId,
    pub partition_id: PartitionId,
    pub num_partitions: u32,
    /// Most batches one procedure may issue.
    pub max_batches: usize,
    pub engine: &'a mut dyn FragmentEngine,
    pub catalog: &'a ProcedureCatalog,
    pub outbox: &'a mut Outbox,
    /// Fragments run during this step.
    pub fragments_executed: u64,
}

impl<'a> ExecutionContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: SiteId,
        partition_id: PartitionId,
        num_partitions: u32,
        max_batches: usize,
        engine: &'a mut dyn FragmentEngine,
        catalog: &'a ProcedureCatalog,
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            site_id,
            partition_id,
            num_partitions,
            max_batches,
            engine,
            catalog,
            outbox,
            fragments_executed: 0,
        }
    }

    /// Run one fragment against the local partition.
    pub fn execute(
        &mut self,
        txn_id: TxnId,
        fragment_id: FragmentId,
        params: &Parameters,
        inputs: &DependencyInputs,
        read_only: bool,
    ) -> Result<Table, FragmentError> {
        self.fragments_executed += 1;
        sysproc::execute_fragment(&mut *self.engine, txn_id, fragment_id, params, inputs, read_only)
    }
}
