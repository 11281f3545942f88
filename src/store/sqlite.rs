//! SQLite-based execution store.
//!
//! Guarded writes are `UPDATE ... WHERE status = ?` statements; counter bumps
//! and record inserts share one transaction.

use super::{AppendOutcome, CancelOutcome, ExecutionStore, SuspendOutcome};
use crate::execution::{now_string, ActionRecord, Execution, ExecutionStatus};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY NOT NULL,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL,
    goal TEXT NOT NULL,
    config TEXT NOT NULL,
    current_iteration INTEGER NOT NULL DEFAULT 0,
    total_actions INTEGER NOT NULL DEFAULT 0,
    total_cost INTEGER NOT NULL DEFAULT 0,
    requested_by TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    result TEXT,
    pending_ticket TEXT,
    approval_deadline TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_executions_ticket ON executions(pending_ticket) WHERE pending_ticket IS NOT NULL;

CREATE TABLE IF NOT EXISTS action_records (
    execution_id TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT,
    cost_units INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (execution_id, iteration),
    FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
);
"#;

const EXECUTION_COLUMNS: &str = "id, agent_type, status, goal, config, current_iteration,
    total_actions, total_cost, requested_by, started_at, updated_at, completed_at, result,
    pending_ticket, approval_deadline, cancel_requested";

pub struct SqliteExecutionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        let db_path = base_dir.join("executions.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create execution store dir: {}", e))?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection in a blocking task.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))?
    }
}

fn conversion_error(idx: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.to_string().into())
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let id: String = row.get(0)?;
    let agent_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let goal: String = row.get(3)?;
    let config: String = row.get(4)?;
    Ok(Execution {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        agent_type: agent_type.parse().map_err(|e: String| conversion_error(1, e))?,
        status: status.parse().map_err(|e: String| conversion_error(2, e))?,
        goal: serde_json::from_str(&goal).map_err(|e| conversion_error(3, e))?,
        config: serde_json::from_str(&config).map_err(|e| conversion_error(4, e))?,
        current_iteration: row.get::<_, i64>(5)? as u32,
        total_actions: row.get::<_, i64>(6)? as u64,
        total_cost: row.get::<_, i64>(7)? as u64,
        requested_by: row.get(8)?,
        started_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
        result: row.get(12)?,
        pending_ticket: row.get(13)?,
        approval_deadline: row.get(14)?,
        cancel_requested: row.get::<_, i64>(15)? != 0,
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ActionRecord> {
    let execution_id: String = row.get(0)?;
    let input: String = row.get(3)?;
    let output: String = row.get(4)?;
    Ok(ActionRecord {
        execution_id: Uuid::parse_str(&execution_id).map_err(|e| conversion_error(0, e))?,
        iteration: row.get::<_, i64>(1)? as u32,
        action_type: row.get(2)?,
        input: serde_json::from_str(&input).map_err(|e| conversion_error(3, e))?,
        output: serde_json::from_str(&output).map_err(|e| conversion_error(4, e))?,
        success: row.get::<_, i64>(5)? != 0,
        error_message: row.get(6)?,
        cost_units: row.get::<_, i64>(7)? as u64,
        duration_ms: row.get::<_, i64>(8)? as u64,
        recorded_at: row.get(9)?,
    })
}

fn load_execution(conn: &Connection, id: &str) -> Result<Option<Execution>, String> {
    conn.query_row(
        &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
        params![id],
        row_to_execution,
    )
    .optional()
    .map_err(|e| e.to_string())
}

/// Bump counters and insert `record` inside `tx`, guarded on status `expected`
/// and the iteration sequence. Returns false if the guard failed.
fn insert_record(
    tx: &Transaction<'_>,
    record: &ActionRecord,
    expected: ExecutionStatus,
) -> Result<bool, String> {
    let id = record.execution_id.to_string();
    let bumped = tx
        .execute(
            "UPDATE executions
             SET current_iteration = current_iteration + 1,
                 total_actions = total_actions + 1,
                 total_cost = total_cost + ?1,
                 updated_at = ?2
             WHERE id = ?3 AND status = ?4 AND current_iteration = ?5",
            params![
                record.cost_units as i64,
                now_string(),
                id,
                expected.as_str(),
                record.iteration as i64
            ],
        )
        .map_err(|e| e.to_string())?;
    if bumped == 0 {
        return Ok(false);
    }
    let input = serde_json::to_string(&record.input).map_err(|e| e.to_string())?;
    let output = serde_json::to_string(&record.output).map_err(|e| e.to_string())?;
    tx.execute(
        "INSERT INTO action_records
            (execution_id, iteration, action_type, input, output, success, error_message,
             cost_units, duration_ms, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            record.iteration as i64,
            record.action_type,
            input,
            output,
            record.success as i64,
            record.error_message,
            record.cost_units as i64,
            record.duration_ms as i64,
            record.recorded_at,
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(true)
}

/// Guarded status write shared by `transition`, `resolve_approval` and cancel.
fn finish(
    conn: &Connection,
    id: &str,
    from: ExecutionStatus,
    ticket: Option<&str>,
    to: ExecutionStatus,
    result: Option<&str>,
) -> Result<bool, String> {
    let now = now_string();
    let completed_at = to.is_terminal().then(|| now.clone());
    let changed = conn
        .execute(
            "UPDATE executions
             SET status = ?1,
                 result = COALESCE(?2, result),
                 completed_at = COALESCE(?3, completed_at),
                 pending_ticket = NULL,
                 approval_deadline = NULL,
                 updated_at = ?4
             WHERE id = ?5 AND status = ?6 AND (?7 IS NULL OR pending_ticket = ?7)",
            params![to.as_str(), result, completed_at, now, id, from.as_str(), ticket],
        )
        .map_err(|e| e.to_string())?;
    Ok(changed > 0)
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), String> {
        let exec = execution.clone();
        self.with_conn(move |conn| {
            let goal = serde_json::to_string(&exec.goal).map_err(|e| e.to_string())?;
            let config = serde_json::to_string(&exec.config).map_err(|e| e.to_string())?;
            conn.execute(
                &format!(
                    "INSERT INTO executions ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    EXECUTION_COLUMNS
                ),
                params![
                    exec.id.to_string(),
                    exec.agent_type.as_str(),
                    exec.status.as_str(),
                    goal,
                    config,
                    exec.current_iteration as i64,
                    exec.total_actions as i64,
                    exec.total_cost as i64,
                    exec.requested_by,
                    exec.started_at,
                    exec.updated_at,
                    exec.completed_at,
                    exec.result,
                    exec.pending_ticket,
                    exec.approval_deadline,
                    exec.cancel_requested as i64,
                ],
            )
            .map_err(|e| format!("Failed to create execution: {}", e))?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, String> {
        self.with_conn(move |conn| load_execution(conn, &id.to_string()))
            .await
    }

    async fn list_executions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Execution>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
                    EXECUTION_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], row_to_execution)
                .map_err(|e| e.to_string())?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions WHERE status = ?1 ORDER BY started_at",
                    EXECUTION_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_execution)
                .map_err(|e| e.to_string())?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn find_by_pending_ticket(&self, ticket_id: &str) -> Result<Option<Execution>, String> {
        let ticket_id = ticket_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM executions WHERE pending_ticket = ?1 AND status = ?2",
                    EXECUTION_COLUMNS
                ),
                params![ticket_id, ExecutionStatus::WaitingForApproval.as_str()],
                row_to_execution,
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn get_actions(&self, id: Uuid) -> Result<Vec<ActionRecord>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT execution_id, iteration, action_type, input, output, success,
                            error_message, cost_units, duration_ms, recorded_at
                     FROM action_records WHERE execution_id = ?1 ORDER BY iteration",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![id.to_string()], row_to_record)
                .map_err(|e| e.to_string())?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn append_action(&self, record: &ActionRecord) -> Result<AppendOutcome, String> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let id = record.execution_id.to_string();
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            if !insert_record(&tx, &record, ExecutionStatus::Running)? {
                drop(tx);
                let reason = match load_execution(conn, &id)? {
                    None => return Err(format!("Execution {} not found", id)),
                    Some(exec) if exec.status != ExecutionStatus::Running => {
                        format!("Execution is {}, not RUNNING", exec.status)
                    }
                    Some(exec) => format!(
                        "Iteration {} out of sequence (expected {})",
                        record.iteration, exec.current_iteration
                    ),
                };
                return Ok(AppendOutcome::Rejected(reason));
            }
            tx.commit().map_err(|e| e.to_string())?;
            load_execution(conn, &id)?
                .map(AppendOutcome::Appended)
                .ok_or_else(|| format!("Execution {} vanished", id))
        })
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        let result = result.map(str::to_string);
        self.with_conn(move |conn| {
            finish(conn, &id.to_string(), from, None, to, result.as_deref())
        })
        .await
    }

    async fn suspend_for_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        deadline: &str,
    ) -> Result<SuspendOutcome, String> {
        let ticket_id = ticket_id.to_string();
        let deadline = deadline.to_string();
        self.with_conn(move |conn| {
            let id = id.to_string();
            let suspended = conn
                .execute(
                    "UPDATE executions
                     SET status = ?1, pending_ticket = ?2, approval_deadline = ?3, updated_at = ?4
                     WHERE id = ?5 AND status = ?6 AND cancel_requested = 0",
                    params![
                        ExecutionStatus::WaitingForApproval.as_str(),
                        ticket_id,
                        deadline,
                        now_string(),
                        id,
                        ExecutionStatus::Running.as_str()
                    ],
                )
                .map_err(|e| e.to_string())?;
            if suspended > 0 {
                return Ok(SuspendOutcome::Suspended);
            }
            // Either not RUNNING, or RUNNING with a pending cancel
            let stopped = conn
                .execute(
                    "UPDATE executions
                     SET status = ?1, result = 'Cancelled', completed_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND cancel_requested = 1",
                    params![
                        ExecutionStatus::Stopped.as_str(),
                        now_string(),
                        id,
                        ExecutionStatus::Running.as_str()
                    ],
                )
                .map_err(|e| e.to_string())?;
            Ok(if stopped > 0 {
                SuspendOutcome::Stopped
            } else {
                SuspendOutcome::NotRunning
            })
        })
        .await
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        decision: Option<&ActionRecord>,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        let ticket_id = ticket_id.to_string();
        let decision = decision.cloned();
        let result = result.map(str::to_string);
        self.with_conn(move |conn| {
            let id_str = id.to_string();
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            let waiting: bool = tx
                .prepare("SELECT 1 FROM executions WHERE id = ?1 AND status = ?2 AND pending_ticket = ?3")
                .map_err(|e| e.to_string())?
                .exists(params![
                    id_str,
                    ExecutionStatus::WaitingForApproval.as_str(),
                    ticket_id
                ])
                .map_err(|e| e.to_string())?;
            if !waiting {
                return Ok(false);
            }
            if let Some(record) = &decision {
                if record.execution_id != id {
                    return Err(format!("Decision record belongs to {}", record.execution_id));
                }
                if !insert_record(&tx, record, ExecutionStatus::WaitingForApproval)? {
                    tracing::warn!(execution_id = %id, "Decision not applied: iteration out of sequence");
                    return Ok(false);
                }
            }
            let applied = finish(
                &tx,
                &id_str,
                ExecutionStatus::WaitingForApproval,
                Some(&ticket_id),
                to,
                result.as_deref(),
            )?;
            if applied {
                tx.commit().map_err(|e| e.to_string())?;
            }
            Ok(applied)
        })
        .await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, String> {
        self.with_conn(move |conn| {
            let id_str = id.to_string();
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            let Some(exec) = load_execution(&tx, &id_str)? else {
                return Ok(CancelOutcome::NotFound);
            };
            let outcome = match exec.status {
                ExecutionStatus::Running => {
                    tx.execute(
                        "UPDATE executions SET cancel_requested = 1, updated_at = ?1
                         WHERE id = ?2 AND status = ?3",
                        params![now_string(), id_str, ExecutionStatus::Running.as_str()],
                    )
                    .map_err(|e| e.to_string())?;
                    CancelOutcome::Flagged
                }
                ExecutionStatus::WaitingForApproval => {
                    tx.execute(
                        "UPDATE executions SET cancel_requested = 1 WHERE id = ?1",
                        params![id_str],
                    )
                    .map_err(|e| e.to_string())?;
                    finish(
                        &tx,
                        &id_str,
                        ExecutionStatus::WaitingForApproval,
                        None,
                        ExecutionStatus::Stopped,
                        Some("Cancelled"),
                    )?;
                    CancelOutcome::Stopped {
                        ticket: exec.pending_ticket,
                    }
                }
                _ => CancelOutcome::AlreadyTerminal,
            };
            tx.commit().map_err(|e| e.to_string())?;
            Ok(outcome)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    async fn store() -> (SqliteExecutionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteExecutionStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_append_keeps_counters_consistent() {
        let (store, _dir) = store().await;
        contract::append_keeps_counters_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_terminal_status_is_a_sink() {
        let (store, _dir) = store().await;
        contract::terminal_status_is_a_sink(&store).await;
    }

    #[tokio::test]
    async fn test_approval_resolution_has_one_winner() {
        let (store, _dir) = store().await;
        contract::approval_resolution_has_one_winner(&store).await;
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let (store, _dir) = store().await;
        contract::cancel_semantics(&store).await;
    }

    #[tokio::test]
    async fn test_listing() {
        let (store, _dir) = store().await;
        contract::listing(&store).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let exec = contract::execution();
        {
            let store = SqliteExecutionStore::new(dir.path().to_path_buf())
                .await
                .unwrap();
            assert!(store.is_persistent());
            store.create_execution(&exec).await.unwrap();
            store
                .append_action(&contract::record(exec.id, 0, "RUN_TESTS", 4))
                .await
                .unwrap();
        }
        let reopened = SqliteExecutionStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let row = reopened.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(row.total_cost, 4);
        assert_eq!(row.config, exec.config);
        let actions = reopened.get_actions(exec.id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, "RUN_TESTS");
    }
}
