//! Error types for the partition engine.

use lockstep_types::FragmentId;
use thiserror::Error;

/// Errors building an engine or its fragment library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A fragment is already registered under this id.
    #[error("fragment {0} is already registered")]
    DuplicateFragment(FragmentId),

    /// The id falls in the range reserved for system fragments.
    #[error("fragment {0} is in the reserved system range")]
    ReservedFragment(FragmentId),
}
