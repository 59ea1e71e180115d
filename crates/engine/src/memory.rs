//! In-memory partition engine.

use crate::library::{FragmentLibrary, PartitionView, UndoEntry};
use indexmap::IndexMap;
use lockstep_core::{DependencyInputs, FragmentEngine, FragmentError, StateFingerprint};
use lockstep_types::{FragmentId, Parameters, PartitionId, Table, TxnId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// One partition replica's rows, kept in key order.
///
/// Writes apply in place and are undone from a per-transaction log on
/// rollback. Only one transaction is ever open at a time on a site, so the
/// log never interleaves two writers on the same key.
pub struct MemoryEngine {
    partition_id: PartitionId,
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    undo: IndexMap<TxnId, Vec<UndoEntry>>,
    library: Arc<FragmentLibrary>,
}

impl MemoryEngine {
    pub fn new(partition_id: PartitionId, library: Arc<FragmentLibrary>) -> Self {
        Self {
            partition_id,
            store: BTreeMap::new(),
            undo: IndexMap::new(),
            library,
        }
    }

    /// Seed committed rows.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
        self.store.extend(rows);
        self
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.store.get(key).map(Vec::as_slice)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Transactions with uncommitted writes.
    pub fn open_transactions(&self) -> usize {
        self.undo.len()
    }
}

impl FragmentEngine for MemoryEngine {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn execute_fragment(
        &mut self,
        txn_id: TxnId,
        fragment_id: FragmentId,
        params: &Parameters,
        inputs: &DependencyInputs,
        read_only: bool,
    ) -> Result<Table, FragmentError> {
        let fragment = self
            .library
            .get(fragment_id)
            .ok_or(FragmentError::UnknownFragment(fragment_id))?;
        trace!(
            partition = %self.partition_id,
            txn_id = %txn_id,
            fragment = %fragment_id,
            "execute fragment"
        );
        let mut view = PartitionView {
            partition_id: self.partition_id,
            txn_id,
            fragment_id,
            read_only,
            store: &mut self.store,
            undo: &mut self.undo,
        };
        fragment(&mut view, params, inputs)
    }

    fn commit(&mut self, txn_id: TxnId) {
        if let Some(entries) = self.undo.shift_remove(&txn_id) {
            trace!(partition = %self.partition_id, txn_id = %txn_id, writes = entries.len(), "commit");
        }
    }

    fn rollback(&mut self, txn_id: TxnId) {
        let Some(entries) = self.undo.shift_remove(&txn_id) else {
            return;
        };
        trace!(partition = %self.partition_id, txn_id = %txn_id, writes = entries.len(), "rollback");
        for entry in entries.into_iter().rev() {
            match entry.previous {
                Some(value) => {
                    self.store.insert(entry.key, value);
                }
                None => {
                    self.store.remove(&entry.key);
                }
            }
        }
    }

    fn fingerprint(&self) -> StateFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.partition_id.0.to_le_bytes());
        for (key, value) in &self.store {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        StateFingerprint(*hasher.finalize().as_bytes())
    }
}
