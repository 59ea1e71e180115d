//! Sample fragments and procedures.
//!
//! A small counter schema: every partition holds named integer counters under
//! `counter/<key>`. The procedures cover each execution path a site has:
//!
//! | Procedure | Kind | Shape |
//! |---|---|---|
//! | [`INCREMENT`] | single-partition | one batch, adds to a counter |
//! | [`MP_INCREMENT`] | multi-partition | adds on every partition, coordinator sums |
//! | [`FAILING`] | single-partition | aborts before planning anything |
//! | [`FAILING_MP`] | multi-partition | first batch hits a constraint violation |
//! | [`CHAINED`] | multi-partition | `n` dependent read batches |
//! | [`READ_TOTAL`] | multi-partition, read-only | sums a counter across partitions |

mod fragments;
mod procedures;

pub use fragments::{
    build_library, counter_key, register_fragments, ADD_COUNTER, READ_COUNTER, SUM_INPUTS,
};
pub use procedures::{
    build_catalog, chained, failing, failing_mp, increment, mp_increment, read_total,
    register_procedures, CHAINED, FAILING, FAILING_MP, INCREMENT, MP_INCREMENT, READ_TOTAL,
};

pub use lockstep_types::test_utils;
