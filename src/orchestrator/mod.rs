//! Job lifecycle orchestration.
//!
//! This module owns the submit / poll-until-terminal / cancel state machine
//! for one backend job. CLI layers consume its event stream to keep run
//! history and progress display current.

mod driver;

pub use driver::{CancelToken, Orchestrator};
