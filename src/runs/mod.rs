//! Run managers.
//!
//! These bind an orchestrator's event stream to the run-history and
//! significance-test stores: building the job payload, seeding the initial
//! entry at submission, and folding each status tick into stored state.

mod estimate;
mod significance;

pub use estimate::{
    initial_run_entry, on_estimate_started, on_estimate_update, prepare_estimate, PreparedEstimate,
};
pub use significance::{
    initial_significance_entry, on_significance_canceled, on_significance_failed,
    on_significance_started, on_significance_update,
};
