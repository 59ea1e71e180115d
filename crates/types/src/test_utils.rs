//! Fixtures shared by tests across the workspace.

use crate::{ParamValue, Parameters, StoredProcedureInvocation, TxnId};

/// Invocation of `procedure` with integer parameters.
pub fn invocation(procedure: &str, ints: &[i64]) -> StoredProcedureInvocation {
    let params: Parameters = ints
        .iter()
        .map(|v| ParamValue::Int(*v))
        .collect::<Vec<_>>()
        .into();
    StoredProcedureInvocation::new(procedure, params, 0)
}

/// Shorthand for a raw transaction id.
pub fn txn(id: u64) -> TxnId {
    TxnId(id)
}
