//! Budget checks for executions.
//!
//! # Invariants
//! - Checks are pure: no counters are mutated here
//! - Cost may overshoot `max_cost_units` by at most one metered action, since
//!   the cost check runs before an action and its price is only known after

use serde::{Deserialize, Serialize};

use crate::execution::ExecutionConfig;

/// Would `current_total + proposed_delta` go past `limit`?
///
/// # Pure Function
/// Saturates instead of overflowing, so `u64::MAX` behaves as "unlimited"
/// only when `limit` is also `u64::MAX`.
pub fn would_exceed(current_total: u64, proposed_delta: u64, limit: u64) -> bool {
    current_total.saturating_add(proposed_delta) > limit
}

/// Outcome of the pre-iteration budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetCheck {
    Within,
    IterationsExhausted { used: u32, limit: u32 },
    CostExceeded { spent: u64, limit: u64 },
}

impl BudgetCheck {
    pub fn is_within(&self) -> bool {
        matches!(self, Self::Within)
    }

    /// Human-readable reason stored as the execution result.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Within => None,
            Self::IterationsExhausted { used, limit } => Some(format!(
                "Iteration budget exhausted: {} of {} iterations used",
                used, limit
            )),
            Self::CostExceeded { spent, limit } => Some(format!(
                "Cost budget exceeded: spent {} of {} units",
                spent, limit
            )),
        }
    }
}

/// Applies one execution's ceilings.
#[derive(Debug, Clone, Copy)]
pub struct BudgetTracker {
    config: ExecutionConfig,
}

impl BudgetTracker {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Check whether iteration `current_iteration` may start.
    ///
    /// # Preconditions
    /// - `current_iteration` is the number of records already appended
    /// - `total_cost` is the sum of their cost units
    ///
    /// # Postconditions
    /// - Iterations are checked before cost
    /// - `Within` iff one more iteration fits and spent cost is not over the ceiling
    pub fn check(&self, current_iteration: u32, total_cost: u64) -> BudgetCheck {
        if would_exceed(
            current_iteration as u64,
            1,
            self.config.max_iterations as u64,
        ) {
            return BudgetCheck::IterationsExhausted {
                used: current_iteration,
                limit: self.config.max_iterations,
            };
        }
        if would_exceed(total_cost, 0, self.config.max_cost_units) {
            return BudgetCheck::CostExceeded {
                spent: total_cost,
                limit: self.config.max_cost_units,
            };
        }
        BudgetCheck::Within
    }
}
