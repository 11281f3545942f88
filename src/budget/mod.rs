//! Budget module - iteration and cost ceilings for an execution.
//!
//! # Key Concepts
//! - `would_exceed`: the single pure check every ceiling goes through
//! - `BudgetTracker`: applies the execution's configured ceilings to its counters

mod budget;

pub use budget::{would_exceed, BudgetCheck, BudgetTracker};
