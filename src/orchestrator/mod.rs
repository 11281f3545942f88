//! Orchestrator - starts executions, drives their run loops and routes
//! approval decisions back into them.
//!
//! # Task model
//! - One detached task per RUNNING execution ([`run_loop`])
//! - One resume handler consuming the decision channel ([`resume`])
//! - One sleep task per pending approval (the timeout timer)
//!
//! None of them hold a reference back to [`Orchestrator`]; they share the
//! [`Engine`] and coordinate only through guarded writes on the store.

mod resume;
mod run_loop;
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agents::AgentType;
use crate::approval::{ApprovalStore, ApprovalTicket, DecisionEvent};
use crate::execution::{ActionRecord, Execution, ExecutionConfig, ExecutionStatus, Goal};
use crate::store::{CancelOutcome, ExecutionStore};
use crate::tools::{ToolInfo, ToolRegistry};
use run_loop::ActiveLoops;

/// Capacity of the decision channel.
const DECISION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decision conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Engine-wide knobs that are not per-execution.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Directory tools resolve relative paths against
    pub working_dir: PathBuf,
    /// Upper bound on a single tool call
    pub tool_timeout: Duration,
    /// Delay before the first retry of a failed store write; doubles per
    /// attempt
    pub write_backoff: Duration,
    /// Ceiling for the write retry delay. Audit writes are retried until
    /// they land.
    pub write_backoff_max: Duration,
    /// Budget used when `start` is called without one
    pub default_config: ExecutionConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            tool_timeout: Duration::from_secs(300),
            write_backoff: Duration::from_millis(200),
            write_backoff_max: Duration::from_secs(30),
            default_config: ExecutionConfig::default(),
        }
    }
}

/// State shared by run loops, the resume handler and approval timers.
pub(crate) struct Engine {
    pub store: Arc<dyn ExecutionStore>,
    pub tools: ToolRegistry,
    pub approvals: Arc<dyn ApprovalStore>,
    pub settings: OrchestratorSettings,
    pub active: ActiveLoops,
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
    decisions: mpsc::Sender<DecisionEvent>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its resume handler.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        tools: ToolRegistry,
        approvals: Arc<dyn ApprovalStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let engine = Arc::new(Engine {
            store,
            tools,
            approvals,
            settings,
            active: ActiveLoops::default(),
        });
        let (tx, rx) = mpsc::channel(DECISION_CHANNEL_CAPACITY);
        tokio::spawn(resume::handle_decisions(engine.clone(), rx));
        Self {
            engine,
            decisions: tx,
        }
    }

    /// Create an execution and launch its run loop. Returns as soon as the
    /// row is persisted.
    ///
    /// # Preconditions
    /// - `agent_type` names a known agent
    /// - `goal` satisfies that agent's parameter requirements
    ///
    /// # Postconditions
    /// - On `Ok(id)`, `get_status(id)` already returns a RUNNING execution
    /// - On `Err`, no execution row was created
    pub async fn start(
        &self,
        agent_type: &str,
        goal: Goal,
        config: Option<ExecutionConfig>,
        requested_by: &str,
    ) -> Result<Uuid, OrchestratorError> {
        let agent_type: AgentType = agent_type
            .parse()
            .map_err(OrchestratorError::Configuration)?;
        agent_type
            .check_goal(&goal)
            .map_err(OrchestratorError::InvalidGoal)?;

        let config = config.unwrap_or(self.engine.settings.default_config);
        let execution = Execution::new(agent_type, goal, config, requested_by);
        self.engine
            .store
            .create_execution(&execution)
            .await
            .map_err(OrchestratorError::Store)?;

        tracing::info!(
            execution_id = %execution.id,
            agent = %agent_type,
            requested_by = %execution.requested_by,
            max_iterations = config.max_iterations,
            max_cost_units = config.max_cost_units,
            "Execution started"
        );
        run_loop::spawn(self.engine.clone(), execution.id);
        Ok(execution.id)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Execution, OrchestratorError> {
        self.engine
            .store
            .get_execution(id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {}", id)))
    }

    /// Audit log of an execution, ordered by iteration.
    pub async fn get_actions(&self, id: Uuid) -> Result<Vec<ActionRecord>, OrchestratorError> {
        // Distinguish "unknown id" from "no actions yet"
        self.get_status(id).await?;
        self.engine
            .store
            .get_actions(id)
            .await
            .map_err(OrchestratorError::Store)
    }

    /// Recent executions, newest first.
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Execution>, OrchestratorError> {
        self.engine
            .store
            .list_executions(limit, offset)
            .await
            .map_err(OrchestratorError::Store)
    }

    /// Request a cooperative stop.
    ///
    /// Returns `true` only if a non-terminal execution existed. A RUNNING
    /// execution stops at its next iteration boundary; a waiting one stops
    /// now and its ticket is expired.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let outcome = self
            .engine
            .store
            .request_cancel(id)
            .await
            .map_err(OrchestratorError::Store)?;
        match outcome {
            CancelOutcome::NotFound | CancelOutcome::AlreadyTerminal => Ok(false),
            CancelOutcome::Flagged => {
                tracing::info!(execution_id = %id, "Cancel requested");
                Ok(true)
            }
            CancelOutcome::Stopped { ticket } => {
                tracing::info!(execution_id = %id, "Execution stopped while waiting for approval");
                if let Some(ticket) = ticket {
                    if let Err(e) = self.engine.approvals.expire(&ticket).await {
                        tracing::warn!(ticket_id = %ticket, "Failed to expire ticket: {}", e);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Publish a decision for the resume handler.
    ///
    /// Delivery is at-least-once safe: the handler ignores decisions for
    /// tickets no execution is waiting on.
    pub async fn submit_decision(&self, decision: DecisionEvent) -> Result<(), OrchestratorError> {
        tracing::debug!(ticket_id = %decision.ticket_id, approved = decision.approved, "Decision submitted");
        self.decisions
            .send(decision)
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)
    }

    /// Manual decision path: commit the verdict on the ticket, then publish it
    /// like any other decision source.
    pub async fn decide(&self, decision: DecisionEvent) -> Result<ApprovalTicket, OrchestratorError> {
        let approvals = &self.engine.approvals;
        if approvals
            .get_ticket(&decision.ticket_id)
            .await
            .map_err(OrchestratorError::Store)?
            .is_none()
        {
            return Err(OrchestratorError::NotFound(format!(
                "ticket {}",
                decision.ticket_id
            )));
        }
        let ticket = approvals
            .record_decision(&decision)
            .await
            .map_err(OrchestratorError::Conflict)?;
        self.submit_decision(decision).await?;
        Ok(ticket)
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<ApprovalTicket, OrchestratorError> {
        self.engine
            .approvals
            .get_ticket(ticket_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("ticket {}", ticket_id)))
    }

    /// Tickets still awaiting a reviewer, oldest first.
    pub async fn pending_tickets(&self) -> Result<Vec<ApprovalTicket>, OrchestratorError> {
        self.engine
            .approvals
            .list_pending()
            .await
            .map_err(OrchestratorError::Store)
    }

    /// Keys and schemas of the registered tools.
    pub fn tools(&self) -> Vec<ToolInfo> {
        self.engine.tools.list_tools()
    }

    pub fn is_persistent(&self) -> bool {
        self.engine.store.is_persistent()
    }

    /// Startup recovery.
    ///
    /// Re-arms approval timers for waiting executions (an already passed
    /// deadline fires at once) and re-drives RUNNING executions from their
    /// persisted history. Returns how many executions were picked up.
    ///
    /// Safe to call more than once: an execution that already has a loop in
    /// this process gets no second one, and duplicate timers lose the
    /// guarded write.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let store = &self.engine.store;

        let waiting = store
            .list_by_status(ExecutionStatus::WaitingForApproval)
            .await
            .map_err(OrchestratorError::Store)?;
        for execution in &waiting {
            let Some(ticket) = execution.pending_ticket.clone() else {
                tracing::warn!(execution_id = %execution.id, "Waiting execution has no ticket");
                continue;
            };
            let delay = resume::remaining(execution.approval_deadline.as_deref());
            resume::arm_timer(self.engine.clone(), execution.id, ticket, delay);
        }

        let running = store
            .list_by_status(ExecutionStatus::Running)
            .await
            .map_err(OrchestratorError::Store)?;
        for execution in &running {
            run_loop::spawn(self.engine.clone(), execution.id);
        }

        if !waiting.is_empty() || !running.is_empty() {
            tracing::info!(
                waiting = waiting.len(),
                running = running.len(),
                "Recovered executions"
            );
        }
        Ok(waiting.len() + running.len())
    }
}
