//! In-memory execution store (non-persistent).
//!
//! Rows and records live behind one lock so that every guarded write
//! (status check, counter bump, record insert) is a single critical section.

use super::{AppendOutcome, CancelOutcome, ExecutionStore, SuspendOutcome};
use crate::execution::{now_string, ActionRecord, Execution, ExecutionStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    executions: HashMap<Uuid, Execution>,
    actions: HashMap<Uuid, Vec<ActionRecord>>,
}

impl State {
    /// Guard shared by `append_action` and `resolve_approval`.
    fn check_append(exec: &Execution, record: &ActionRecord) -> Result<(), String> {
        if record.iteration != exec.current_iteration {
            return Err(format!(
                "Iteration {} out of sequence (expected {})",
                record.iteration, exec.current_iteration
            ));
        }
        Ok(())
    }

    fn push_record(&mut self, record: &ActionRecord) {
        if let Some(exec) = self.executions.get_mut(&record.execution_id) {
            exec.current_iteration += 1;
            exec.total_actions += 1;
            exec.total_cost = exec.total_cost.saturating_add(record.cost_units);
            exec.updated_at = now_string();
        }
        self.actions
            .entry(record.execution_id)
            .or_default()
            .push(record.clone());
    }
}

fn finish(exec: &mut Execution, to: ExecutionStatus, result: Option<&str>) {
    let now = now_string();
    exec.status = to;
    exec.pending_ticket = None;
    exec.approval_deadline = None;
    if let Some(result) = result {
        exec.result = Some(result.to_string());
    }
    if to.is_terminal() {
        exec.completed_at = Some(now.clone());
    }
    exec.updated_at = now;
}

#[derive(Clone)]
pub struct InMemoryExecutionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), String> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&execution.id) {
            return Err(format!("Execution {} already exists", execution.id));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, String> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Execution>, String> {
        let mut executions: Vec<Execution> =
            self.state.read().await.executions.values().cloned().collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>, String> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_pending_ticket(&self, ticket_id: &str) -> Result<Option<Execution>, String> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .find(|e| {
                e.status == ExecutionStatus::WaitingForApproval
                    && e.pending_ticket.as_deref() == Some(ticket_id)
            })
            .cloned())
    }

    async fn get_actions(&self, id: Uuid) -> Result<Vec<ActionRecord>, String> {
        Ok(self
            .state
            .read()
            .await
            .actions
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_action(&self, record: &ActionRecord) -> Result<AppendOutcome, String> {
        let mut state = self.state.write().await;
        let Some(exec) = state.executions.get(&record.execution_id) else {
            return Err(format!("Execution {} not found", record.execution_id));
        };
        if exec.status != ExecutionStatus::Running {
            return Ok(AppendOutcome::Rejected(format!(
                "Execution is {}, not RUNNING",
                exec.status
            )));
        }
        if let Err(reason) = State::check_append(exec, record) {
            return Ok(AppendOutcome::Rejected(reason));
        }
        state.push_record(record);
        let updated = state
            .executions
            .get(&record.execution_id)
            .cloned()
            .ok_or_else(|| format!("Execution {} vanished", record.execution_id))?;
        Ok(AppendOutcome::Appended(updated))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&id) {
            Some(exec) if exec.status == from => {
                finish(exec, to, result);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn suspend_for_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        deadline: &str,
    ) -> Result<SuspendOutcome, String> {
        let mut state = self.state.write().await;
        let Some(exec) = state.executions.get_mut(&id) else {
            return Ok(SuspendOutcome::NotRunning);
        };
        if exec.status != ExecutionStatus::Running {
            return Ok(SuspendOutcome::NotRunning);
        }
        if exec.cancel_requested {
            finish(exec, ExecutionStatus::Stopped, Some("Cancelled"));
            return Ok(SuspendOutcome::Stopped);
        }
        exec.status = ExecutionStatus::WaitingForApproval;
        exec.pending_ticket = Some(ticket_id.to_string());
        exec.approval_deadline = Some(deadline.to_string());
        exec.updated_at = now_string();
        Ok(SuspendOutcome::Suspended)
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        decision: Option<&ActionRecord>,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        let mut state = self.state.write().await;
        let Some(exec) = state.executions.get(&id) else {
            return Ok(false);
        };
        if exec.status != ExecutionStatus::WaitingForApproval
            || exec.pending_ticket.as_deref() != Some(ticket_id)
        {
            return Ok(false);
        }
        if let Some(record) = decision {
            if record.execution_id != id {
                return Err(format!("Decision record belongs to {}", record.execution_id));
            }
            if let Err(reason) = State::check_append(exec, record) {
                tracing::warn!(execution_id = %id, "Decision not applied: {}", reason);
                return Ok(false);
            }
            state.push_record(record);
        }
        match state.executions.get_mut(&id) {
            Some(exec) => {
                finish(exec, to, result);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, String> {
        let mut state = self.state.write().await;
        let Some(exec) = state.executions.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match exec.status {
            ExecutionStatus::Running => {
                exec.cancel_requested = true;
                exec.updated_at = now_string();
                Ok(CancelOutcome::Flagged)
            }
            ExecutionStatus::WaitingForApproval => {
                let ticket = exec.pending_ticket.clone();
                exec.cancel_requested = true;
                finish(exec, ExecutionStatus::Stopped, Some("Cancelled"));
                Ok(CancelOutcome::Stopped { ticket })
            }
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }
}
