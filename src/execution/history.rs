//! Append-only, totally ordered audit log of one execution.
//!
//! # Invariants
//! - Records belong to a single execution
//! - Iterations are contiguous from 0: record `i` has `iteration == i`
//!
//! The history is always rebuilt from the store on entry to the run loop;
//! planners only ever see it through this type.

use super::types::ActionRecord;
use uuid::Uuid;

/// Errors raised when a record would break the ordering invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("Record for execution {found} appended to history of {expected}")]
    ForeignRecord { expected: Uuid, found: Uuid },

    #[error("Out-of-order iteration: expected {expected}, got {found}")]
    OutOfOrder { expected: u32, found: u32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionHistory {
    records: Vec<ActionRecord>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from persisted records, sorting by iteration and
    /// verifying contiguity.
    pub fn from_records(mut records: Vec<ActionRecord>) -> Result<Self, HistoryError> {
        records.sort_by_key(|r| r.iteration);
        let mut history = Self::new();
        for record in records {
            history.append(record)?;
        }
        Ok(history)
    }

    /// Append a record.
    ///
    /// # Precondition
    /// `record.iteration == self.next_iteration()`
    pub fn append(&mut self, record: ActionRecord) -> Result<(), HistoryError> {
        if let Some(first) = self.records.first() {
            if first.execution_id != record.execution_id {
                return Err(HistoryError::ForeignRecord {
                    expected: first.execution_id,
                    found: record.execution_id,
                });
            }
        }
        let expected = self.next_iteration();
        if record.iteration != expected {
            return Err(HistoryError::OutOfOrder {
                expected,
                found: record.iteration,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `max(iteration) + 1`, or 0 for an empty history.
    pub fn next_iteration(&self) -> u32 {
        self.records.last().map(|r| r.iteration + 1).unwrap_or(0)
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.records.last()
    }

    /// Latest successful record of the given action type.
    pub fn last_success(&self, action_type: &str) -> Option<&ActionRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.success && r.action_type == action_type)
    }

    /// Successful records of the given action type, oldest first.
    pub fn successes<'a>(&'a self, action_type: &'a str) -> impl Iterator<Item = &'a ActionRecord> {
        self.records
            .iter()
            .filter(move |r| r.success && r.action_type == action_type)
    }

    /// Number of consecutive failed records at the tail sharing the last
    /// record's action type.
    pub fn trailing_failures(&self) -> u32 {
        let Some(last) = self.records.last() else {
            return 0;
        };
        self.records
            .iter()
            .rev()
            .take_while(|r| !r.success && r.action_type == last.action_type)
            .count() as u32
    }
}
