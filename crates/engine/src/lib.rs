//! In-memory partition engine for the Lockstep execution core.
//!
//! Stands in for the real storage layer: a key-ordered row store per
//! partition replica, plan fragments registered as closures in a shared
//! [`FragmentLibrary`], per-transaction undo, and a blake3 state fingerprint
//! used to check that replicas stayed identical.

mod error;
mod library;
mod memory;

pub use error::EngineError;
pub use library::{FragmentFn, FragmentLibrary, PartitionView};
pub use memory::MemoryEngine;
