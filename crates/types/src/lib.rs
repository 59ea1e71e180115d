//! Core types for the Lockstep execution core.
//!
//! Everything in here is plain data: identifiers, transaction ids, the opaque
//! payloads shipped between sites, and the `Topology` abstraction the catalog
//! layer supplies. No I/O and no protocol logic.

mod identifiers;
mod payload;
mod topology;
mod txn_id;

pub use identifiers::{DependencyId, FragmentId, PartitionId, SiteId};
pub use payload::{
    ClientResponse, ParamValue, Parameters, ResponseStatus, StoredProcedureInvocation, Table,
};
pub use topology::{partition_for_key, StaticTopology, Topology, TopologyError};
pub use txn_id::{TxnId, TxnIdError, TxnIdGenerator, MAX_INITIATOR_ID};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
