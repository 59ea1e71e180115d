//! Opaque payloads shipped between sites.
//!
//! Row and table formats belong to the storage layer; here a table is just a
//! list of byte rows and parameters are a small tagged value list.

use serde::{Deserialize, Serialize};

/// A single procedure or fragment parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamValue {
    /// SQL NULL.
    Null,
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// Ordered parameter list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameters(pub Vec<ParamValue>);

impl Parameters {
    /// Create an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn with(mut self, value: ParamValue) -> Self {
        self.0.push(value);
        self
    }

    /// Get a parameter by position.
    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.0.get(index)
    }

    /// Get an integer parameter by position.
    pub fn int(&self, index: usize) -> Option<i64> {
        match self.0.get(index) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a byte-like parameter (bytes or text) by position.
    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        match self.0.get(index) {
            Some(ParamValue::Bytes(b)) => Some(b),
            Some(ParamValue::Text(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ParamValue>> for Parameters {
    fn from(values: Vec<ParamValue>) -> Self {
        Parameters(values)
    }
}

/// Result table, opaque to the execution core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Table {
    /// Encoded rows.
    pub rows: Vec<Vec<u8>>,
}

impl Table {
    /// Create an empty table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a table from rows.
    pub fn from_rows(rows: Vec<Vec<u8>>) -> Self {
        Self { rows }
    }

    /// Create a one-row table holding a single integer (little-endian).
    pub fn scalar(value: i64) -> Self {
        Self {
            rows: vec![value.to_le_bytes().to_vec()],
        }
    }

    /// Read back a table produced by [`Table::scalar`].
    pub fn as_scalar(&self) -> Option<i64> {
        let row = self.rows.first()?;
        let bytes: [u8; 8] = row.as_slice().try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }
}

/// Client request carried by an `InitiateTaskMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProcedureInvocation {
    /// Name of the procedure in the catalog.
    pub procedure: String,
    /// Invocation parameters.
    pub params: Parameters,
    /// Opaque handle the front end uses to route the response.
    pub client_handle: u64,
}

impl StoredProcedureInvocation {
    /// Create a new invocation.
    pub fn new(procedure: impl Into<String>, params: Parameters, client_handle: u64) -> Self {
        Self {
            procedure: procedure.into(),
            params,
            client_handle,
        }
    }
}

/// Outcome class of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Committed.
    Success,
    /// The procedure asked to roll back.
    UserAbort,
    /// Rolled back by the system (bad request, fragment failure, batch limit).
    GracefulFailure,
}

/// Response returned to the initiator for a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Outcome class.
    pub status: ResponseStatus,
    /// Result tables (empty unless the procedure committed).
    pub results: Vec<Table>,
    /// Human-readable detail for failures.
    pub status_string: Option<String>,
}

impl ClientResponse {
    /// Successful response.
    pub fn success(results: Vec<Table>) -> Self {
        Self {
            status: ResponseStatus::Success,
            results,
            status_string: None,
        }
    }

    /// Failed response.
    pub fn failure(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            results: Vec::new(),
            status_string: Some(message.into()),
        }
    }

    /// Whether the transaction committed.
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_table() {
        assert_eq!(Table::scalar(-42).as_scalar(), Some(-42));
        assert_eq!(Table::empty().as_scalar(), None);
        assert_eq!(Table::from_rows(vec![vec![1, 2]]).as_scalar(), None);
    }

    #[test]
    fn test_parameter_accessors() {
        let params = Parameters::new()
            .with(ParamValue::Int(7))
            .with(ParamValue::Text("key".into()))
            .with(ParamValue::Null);
        assert_eq!(params.int(0), Some(7));
        assert_eq!(params.int(1), None);
        assert_eq!(params.bytes(1), Some(&b"key"[..]));
        assert_eq!(params.bytes(2), None);
        assert_eq!(params.len(), 3);
    }
}
