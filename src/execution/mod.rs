//! Execution module - goals, execution rows and the action audit log.
//!
//! This module is designed with checkable invariants in mind:
//! - Status is a closed enum with an explicit terminal set
//! - The audit log enforces contiguous iteration numbers on append
//! - Counters on the execution row are derived from the log, never guessed

mod history;
mod types;

pub use history::{ActionHistory, HistoryError};
pub use types::{
    now_string, ActionRecord, Execution, ExecutionConfig, ExecutionStatus, Goal,
};
