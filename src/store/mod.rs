//! Execution storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, survives restarts
//!
//! # Concurrency contract
//! Every mutation of an execution row is a conditional update on its status
//! (and, where relevant, its pending ticket or iteration). Racing writers
//! (run loop, resume handler, approval timer, cancel) therefore never need a
//! lock of their own: exactly one guarded write wins and the others observe
//! a no-op.

mod memory;
mod sqlite;

pub use memory::InMemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use crate::execution::{ActionRecord, Execution, ExecutionStatus};

/// Result of an append attempt.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Record stored; the execution row after its counters were bumped
    Appended(Execution),
    /// Guard failed (not RUNNING, or iteration out of sequence)
    Rejected(String),
}

/// Result of the RUNNING → WAITING_FOR_APPROVAL write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Suspended,
    /// A cancel landed first; the execution went to STOPPED instead
    Stopped,
    /// The execution was no longer RUNNING
    NotRunning,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal,
    /// RUNNING: the flag is set and the run loop will stop at its next check
    Flagged,
    /// WAITING_FOR_APPROVAL: stopped immediately; carries the abandoned ticket
    Stopped { ticket: Option<String> },
}

/// Execution store trait - implemented by all storage backends.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn create_execution(&self, execution: &Execution) -> Result<(), String>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, String>;

    /// List executions, newest first.
    async fn list_executions(&self, limit: usize, offset: usize)
        -> Result<Vec<Execution>, String>;

    /// All executions currently in `status` (startup recovery).
    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>, String>;

    /// The waiting execution suspended on `ticket_id`, if any.
    async fn find_by_pending_ticket(&self, ticket_id: &str) -> Result<Option<Execution>, String>;

    /// Audit log of an execution, ordered by iteration.
    async fn get_actions(&self, id: Uuid) -> Result<Vec<ActionRecord>, String>;

    /// Store a record and fold it into the counters in one atomic write.
    ///
    /// # Preconditions (guard)
    /// - status is RUNNING
    /// - `record.iteration == current_iteration`
    ///
    /// # Postconditions
    /// - `current_iteration`, `total_actions` += 1; `total_cost` += cost
    async fn append_action(&self, record: &ActionRecord) -> Result<AppendOutcome, String>;

    /// Move `from` → `to` if the row is still in `from`.
    ///
    /// Sets `completed_at` when `to` is terminal. Returns whether the write
    /// applied.
    async fn transition(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String>;

    /// RUNNING → WAITING_FOR_APPROVAL on `ticket_id`, unless a cancel was
    /// requested, in which case RUNNING → STOPPED.
    async fn suspend_for_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        deadline: &str,
    ) -> Result<SuspendOutcome, String>;

    /// Leave WAITING_FOR_APPROVAL for `to`, only if still waiting on
    /// `ticket_id`. When `decision` is given it is appended in the same
    /// write, under the same iteration guard as [`append_action`].
    ///
    /// [`append_action`]: ExecutionStore::append_action
    async fn resolve_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        decision: Option<&ActionRecord>,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String>;

    /// Cooperative cancel, see [`CancelOutcome`].
    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, String>;
}

/// Execution store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            other => {
                tracing::warn!("Unknown execution store '{}', using sqlite", other);
                Self::default()
            }
        }
    }
}

/// Create an execution store based on type and data directory.
pub async fn create_execution_store(
    store_type: StoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn ExecutionStore>, String> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryExecutionStore::new())),
        StoreType::Sqlite => {
            let store = SqliteExecutionStore::new(base_dir).await?;
            Ok(Box::new(store))
        }
    }
}
