//! Procedure catalog.

use crate::{sysproc, Procedure};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors building a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// A procedure with this name is already registered.
    #[error("procedure {0} is already registered")]
    Duplicate(String),
}

/// How a procedure is routed and executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    /// Runs entirely on one partition.
    SinglePartition,
    /// Coordinated across every partition.
    MultiPartition,
    /// Built-in administrative procedure; coordinated like a
    /// multi-partition procedure and always read-only.
    System,
}

impl ProcedureKind {
    /// Whether the initiator must fan the transaction out to every site.
    pub fn is_multi_partition(&self) -> bool {
        match self {
            ProcedureKind::SinglePartition => false,
            ProcedureKind::MultiPartition | ProcedureKind::System => true,
        }
    }
}

/// Catalog entry for one procedure.
#[derive(Clone)]
pub struct ProcedureInfo {
    pub name: String,
    pub kind: ProcedureKind,
    pub read_only: bool,
    pub procedure: Arc<dyn Procedure>,
}

impl ProcedureInfo {
    pub fn new(
        name: impl Into<String>,
        kind: ProcedureKind,
        read_only: bool,
        procedure: impl Procedure + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            read_only: read_only || kind == ProcedureKind::System,
            procedure: Arc::new(procedure),
        }
    }
}

impl fmt::Debug for ProcedureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Named procedures available to every site.
///
/// Shared read-only between sites behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ProcedureCatalog {
    procedures: BTreeMap<String, ProcedureInfo>,
}

impl ProcedureCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in system procedures.
    pub fn with_system_procedures() -> Self {
        let mut procedures = BTreeMap::new();
        for info in sysproc::system_procedures() {
            procedures.insert(info.name.clone(), info);
        }
        Self { procedures }
    }

    /// Add a procedure.
    pub fn register(&mut self, info: ProcedureInfo) -> Result<(), CatalogError> {
        if self.procedures.contains_key(&info.name) {
            return Err(CatalogError::Duplicate(info.name));
        }
        self.procedures.insert(info.name.clone(), info);
        Ok(())
    }

    /// Look a procedure up by name.
    pub fn get(&self, name: &str) -> Option<&ProcedureInfo> {
        self.procedures.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcedureContext, ProcedureError, ProcedureRun, ProcedureStep};
    use crate::BatchResults;
    use lockstep_types::Parameters;

    struct Noop;

    struct NoopRun;

    impl ProcedureRun for NoopRun {
        fn resume(
            &mut self,
            _previous: Option<BatchResults>,
        ) -> Result<ProcedureStep, ProcedureError> {
            Ok(ProcedureStep::Done(Vec::new()))
        }
    }

    impl Procedure for Noop {
        fn start(
            &self,
            _ctx: &ProcedureContext,
            _params: &Parameters,
        ) -> Result<Box<dyn ProcedureRun>, ProcedureError> {
            Ok(Box::new(NoopRun))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut catalog = ProcedureCatalog::new();
        catalog
            .register(ProcedureInfo::new("Noop", ProcedureKind::SinglePartition, false, Noop))
            .unwrap();
        let info = catalog.get("Noop").unwrap();
        assert_eq!(info.kind, ProcedureKind::SinglePartition);
        assert!(!info.read_only);
        assert!(catalog.get("Missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut catalog = ProcedureCatalog::new();
        catalog
            .register(ProcedureInfo::new("Noop", ProcedureKind::SinglePartition, false, Noop))
            .unwrap();
        assert_eq!(
            catalog.register(ProcedureInfo::new("Noop", ProcedureKind::MultiPartition, false, Noop)),
            Err(CatalogError::Duplicate("Noop".into()))
        );
    }

    #[test]
    fn test_system_procedures_are_read_only_multi_partition() {
        let catalog = ProcedureCatalog::with_system_procedures();
        let info = catalog.get(sysproc::FINGERPRINT_PROCEDURE).unwrap();
        assert_eq!(info.kind, ProcedureKind::System);
        assert!(info.kind.is_multi_partition());
        assert!(info.read_only);
    }
}
