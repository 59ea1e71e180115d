//! The fragment engine seam.

use lockstep_types::{DependencyId, FragmentId, Parameters, PartitionId, Table, TxnId};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while executing one plan fragment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// No fragment registered under this id.
    #[error("unknown fragment {0}")]
    UnknownFragment(FragmentId),

    /// A declared input dependency has no tables.
    #[error("missing input dependency {0}")]
    MissingInput(DependencyId),

    /// A parameter is missing or has the wrong type.
    #[error("bad parameter {index}: {reason}")]
    BadParameter {
        /// Position in the parameter list.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A data constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A write was attempted by a read-only transaction.
    #[error("fragment {0} writes in a read-only transaction")]
    ReadOnlyViolation(FragmentId),

    /// Storage failure.
    #[error("engine error: {0}")]
    Engine(String),
}

impl FragmentError {
    /// Whether this failure is caused by the procedure's input rather than the
    /// engine. User errors roll back gracefully; they say nothing about the
    /// health of the site.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            FragmentError::BadParameter { .. }
                | FragmentError::Constraint(_)
                | FragmentError::ReadOnlyViolation(_)
        )
    }
}

/// Tables produced by earlier fragments, keyed by the dependency they satisfy.
///
/// A dependency fed by an all-sites fragment holds one table per partition,
/// in partition order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyInputs(BTreeMap<DependencyId, Vec<Table>>);

impl DependencyInputs {
    /// Create an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tables for a dependency.
    pub fn insert(&mut self, dep: DependencyId, tables: Vec<Table>) {
        self.0.insert(dep, tables);
    }

    /// Tables for a dependency, if present.
    pub fn get(&self, dep: DependencyId) -> Option<&[Table]> {
        self.0.get(&dep).map(Vec::as_slice)
    }

    /// Tables for a dependency, or `MissingInput`.
    pub fn require(&self, dep: DependencyId) -> Result<&[Table], FragmentError> {
        self.get(dep).ok_or(FragmentError::MissingInput(dep))
    }

    /// Iterate dependencies in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&DependencyId, &Vec<Table>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Digest of a partition replica's data.
///
/// Replicas that applied the same transactions in the same order have equal
/// fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StateFingerprint(pub [u8; 32]);

impl StateFingerprint {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild a fingerprint from a table row produced by `@Fingerprint`.
    pub fn from_row(row: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = row.try_into().ok()?;
        Some(Self(bytes))
    }

    /// First eight bytes as hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for StateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Executes plan fragments against one partition replica.
///
/// Writes are tentative until `commit`; `rollback` undoes every write the
/// transaction made. Implementations must be deterministic: the same
/// fragments with the same inputs in the same txn order produce the same
/// state on every replica.
pub trait FragmentEngine: Send {
    /// Partition this engine stores.
    fn partition_id(&self) -> PartitionId;

    /// Run one fragment on behalf of `txn_id`.
    fn execute_fragment(
        &mut self,
        txn_id: TxnId,
        fragment_id: FragmentId,
        params: &Parameters,
        inputs: &DependencyInputs,
        read_only: bool,
    ) -> Result<Table, FragmentError>;

    /// Make the transaction's writes permanent.
    fn commit(&mut self, txn_id: TxnId);

    /// Undo the transaction's writes. A transaction that wrote nothing is a
    /// no-op.
    fn rollback(&mut self, txn_id: TxnId);

    /// Digest of the committed state.
    fn fingerprint(&self) -> StateFingerprint;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_reports_missing_dependency() {
        let mut inputs = DependencyInputs::new();
        inputs.insert(DependencyId(1), vec![Table::scalar(3)]);
        assert_eq!(inputs.require(DependencyId(1)).unwrap().len(), 1);
        assert_eq!(
            inputs.require(DependencyId(2)).unwrap_err(),
            FragmentError::MissingInput(DependencyId(2))
        );
    }

    #[test]
    fn test_user_errors() {
        assert!(FragmentError::Constraint("negative".into()).is_user_error());
        assert!(FragmentError::ReadOnlyViolation(FragmentId(1)).is_user_error());
        assert!(!FragmentError::Engine("io".into()).is_user_error());
        assert!(!FragmentError::UnknownFragment(FragmentId(1)).is_user_error());
    }

    #[test]
    fn test_fingerprint_display() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let fp = StateFingerprint(bytes);
        assert!(fp.to_string().starts_with("ab00"));
        assert_eq!(fp.to_string().len(), 64);
        assert_eq!(fp.short(), "ab00000000000000");
        assert_eq!(StateFingerprint::from_row(&bytes), Some(fp));
        assert_eq!(StateFingerprint::from_row(&bytes[..4]), None);
    }
}
