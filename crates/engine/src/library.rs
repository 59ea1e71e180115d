//! Fragment library and the partition view fragments run against.

use crate::EngineError;
use indexmap::IndexMap;
use lockstep_core::{sysproc, DependencyInputs, FragmentError};
use lockstep_types::{FragmentId, Parameters, PartitionId, Table, TxnId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Signature of a plan fragment.
pub type FragmentFn = dyn Fn(
    &mut PartitionView<'_>,
    &Parameters,
    &DependencyInputs,
) -> Result<Table, FragmentError>
    + Send
    + Sync;

/// Prior value of a key, restored on rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) previous: Option<Vec<u8>>,
}

/// Plan fragments by id, shared by every replica's engine.
#[derive(Clone, Default)]
pub struct FragmentLibrary {
    fragments: BTreeMap<FragmentId, Arc<FragmentFn>>,
}

impl FragmentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment under `id`.
    pub fn register<F>(&mut self, id: FragmentId, fragment: F) -> Result<(), EngineError>
    where
        F: Fn(&mut PartitionView<'_>, &Parameters, &DependencyInputs) -> Result<Table, FragmentError>
            + Send
            + Sync
            + 'static,
    {
        if sysproc::is_system_fragment(id) {
            return Err(EngineError::ReservedFragment(id));
        }
        if self.fragments.contains_key(&id) {
            return Err(EngineError::DuplicateFragment(id));
        }
        self.fragments.insert(id, Arc::new(fragment));
        Ok(())
    }

    pub fn get(&self, id: FragmentId) -> Option<Arc<FragmentFn>> {
        self.fragments.get(&id).cloned()
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.fragments.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl fmt::Debug for FragmentLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentLibrary")
            .field("fragments", &self.fragments.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A fragment's access to the partition's rows.
///
/// Every write records the key's prior value in the transaction's undo log.
pub struct PartitionView<'a> {
    pub(crate) partition_id: PartitionId,
    pub(crate) txn_id: TxnId,
    pub(crate) fragment_id: FragmentId,
    pub(crate) read_only: bool,
    pub(crate) store: &'a mut BTreeMap<Vec<u8>, Vec<u8>>,
    pub(crate) undo: &'a mut IndexMap<TxnId, Vec<UndoEntry>>,
}

impl PartitionView<'_> {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.store.get(key).map(Vec::as_slice)
    }

    /// Read an integer row; absent keys read as `None`.
    pub fn get_int(&self, key: &[u8]) -> Result<Option<i64>, FragmentError> {
        match self.store.get(key) {
            None => Ok(None),
            Some(value) => {
                let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                    FragmentError::Engine(format!("row {} is not an integer", display_key(key)))
                })?;
                Ok(Some(i64::from_le_bytes(bytes)))
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), FragmentError> {
        self.check_writable()?;
        let previous = self.store.insert(key.to_vec(), value);
        self.record(key, previous);
        Ok(())
    }

    pub fn put_int(&mut self, key: &[u8], value: i64) -> Result<(), FragmentError> {
        self.put(key, value.to_le_bytes().to_vec())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        self.check_writable()?;
        let previous = self.store.remove(key);
        if previous.is_some() {
            self.record(key, previous.clone());
        }
        Ok(previous)
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix<'s>(&'s self, prefix: &'s [u8]) -> impl Iterator<Item = (&'s [u8], &'s [u8])> {
        self.store
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn check_writable(&self) -> Result<(), FragmentError> {
        if self.read_only {
            return Err(FragmentError::ReadOnlyViolation(self.fragment_id));
        }
        Ok(())
    }

    fn record(&mut self, key: &[u8], previous: Option<Vec<u8>>) {
        self.undo.entry(self.txn_id).or_default().push(UndoEntry {
            key: key.to_vec(),
            previous,
        });
    }
}

fn display_key(key: &[u8]) -> String {
    String::from_utf8(key.to_vec()).unwrap_or_else(|_| format!("{key:?}"))
}
