//! Counter fragments.

use lockstep_core::FragmentError;
use lockstep_engine::{EngineError, FragmentLibrary};
use lockstep_types::{FragmentId, Parameters, Table};
use std::sync::Arc;

/// `[key]` → the counter's value (0 when absent).
pub const READ_COUNTER: FragmentId = FragmentId(1);

/// `[key, delta]` → the counter's new value. Counters may not go negative.
pub const ADD_COUNTER: FragmentId = FragmentId(2);

/// `[]` → sum of every scalar input table.
pub const SUM_INPUTS: FragmentId = FragmentId(3);

/// Row key of a counter.
pub fn counter_key(key: i64) -> Vec<u8> {
    format!("counter/{key}").into_bytes()
}

fn int_param(params: &Parameters, index: usize) -> Result<i64, FragmentError> {
    params.int(index).ok_or(FragmentError::BadParameter {
        index,
        reason: "expected an integer".into(),
    })
}

/// Register every counter fragment.
pub fn register_fragments(library: &mut FragmentLibrary) -> Result<(), EngineError> {
    library.register(READ_COUNTER, |view, params, _| {
        let key = counter_key(int_param(params, 0)?);
        Ok(Table::scalar(view.get_int(&key)?.unwrap_or_default()))
    })?;
    library.register(ADD_COUNTER, |view, params, _| {
        let key = counter_key(int_param(params, 0)?);
        let delta = int_param(params, 1)?;
        let next = view.get_int(&key)?.unwrap_or_default() + delta;
        if next < 0 {
            return Err(FragmentError::Constraint(format!(
                "counter {} would drop to {next}",
                String::from_utf8_lossy(&key)
            )));
        }
        view.put_int(&key, next)?;
        Ok(Table::scalar(next))
    })?;
    library.register(SUM_INPUTS, |_, _, inputs| {
        let total = inputs
            .iter()
            .flat_map(|(_, tables)| tables.iter())
            .filter_map(Table::as_scalar)
            .sum();
        Ok(Table::scalar(total))
    })?;
    Ok(())
}

/// Library holding every counter fragment.
pub fn build_library() -> Arc<FragmentLibrary> {
    let mut library = FragmentLibrary::new();
    register_fragments(&mut library).expect("counter fragment ids are distinct");
    Arc::new(library)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{DependencyInputs, FragmentEngine};
    use lockstep_engine::MemoryEngine;
    use lockstep_types::{ParamValue, PartitionId, TxnId};

    #[test]
    fn test_counter_fragments() {
        let mut engine = MemoryEngine::new(PartitionId(0), build_library());
        let add = Parameters::new()
            .with(ParamValue::Int(7))
            .with(ParamValue::Int(5));
        let table = engine
            .execute_fragment(TxnId(1), ADD_COUNTER, &add, &DependencyInputs::new(), false)
            .unwrap();
        assert_eq!(table.as_scalar(), Some(5));

        let read = Parameters::new().with(ParamValue::Int(7));
        let table = engine
            .execute_fragment(TxnId(1), READ_COUNTER, &read, &DependencyInputs::new(), true)
            .unwrap();
        assert_eq!(table.as_scalar(), Some(5));

        let overdraw = Parameters::new()
            .with(ParamValue::Int(7))
            .with(ParamValue::Int(-6));
        let err = engine
            .execute_fragment(TxnId(1), ADD_COUNTER, &overdraw, &DependencyInputs::new(), false)
            .unwrap_err();
        assert!(err.is_user_error());
    }
}
