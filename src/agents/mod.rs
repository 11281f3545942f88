//! Agents module - the planners that drive executions.
//!
//! # Agent Types
//! - **TestGenerator**: story → generated test → approval → commit
//! - **SelfHealingFixer**: broken locator → replacement → rerun
//! - **FlakyTestFixer**: repeated runs → stabilization → approval → commit
//! - **FailureAnalyzer**: failure → classification
//! - **QualityMonitor**: test run → summarized report
//!
//! # Design Principles
//! - Planners are pure functions of `(goal, history)`; they never perform
//!   effects, they only name the next tool call
//! - Dispatch is a closed enum matched exhaustively
//! - Failure handling (retry vs. abort) is shared, see [`policy`]

mod failure_analyzer;
pub mod policy;
mod quality_monitor;
mod self_healing;
mod test_generator;
mod types;

pub use types::{AgentType, NextAction, Plan};
