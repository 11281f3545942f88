//! The per-execution run loop.
//!
//! Each pass: reload the row, honor cancel, rebuild the history from the
//! audit log, ask the planner, check the budget, run one tool, append its
//! record. Nothing survives between passes except what the store holds, so
//! the same code both starts and resumes an execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::resume;
use super::Engine;
use crate::agents::Plan;
use crate::budget::BudgetTracker;
use crate::execution::{now_string, ActionHistory, ActionRecord, Execution, ExecutionStatus};
use crate::store::{AppendOutcome, SuspendOutcome};
use crate::tools::{self, keys, ToolContext};

/// Executions with a live loop task in this process.
///
/// At most one task drives an execution. A spawn request for an execution
/// that already has one is folded into a "make another pass" flag, which the
/// task checks before it exits.
#[derive(Default)]
pub(crate) struct ActiveLoops {
    loops: Mutex<HashMap<Uuid, bool>>,
}

impl ActiveLoops {
    /// `true` if the caller must start the task for `id`.
    fn claim(&self, id: Uuid) -> bool {
        let mut loops = self.lock();
        match loops.get_mut(&id) {
            Some(again) => {
                *again = true;
                false
            }
            None => {
                loops.insert(id, false);
                true
            }
        }
    }

    /// `true` if the task for `id` may exit; `false` if another pass was
    /// requested while it ran.
    fn release(&self, id: Uuid) -> bool {
        let mut loops = self.lock();
        match loops.get_mut(&id) {
            Some(again) if *again => {
                *again = false;
                false
            }
            _ => {
                loops.remove(&id);
                true
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, bool>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Launch the loop for `id` as a detached task, unless one is already
/// driving it.
///
/// Store errors do not orphan the execution: the task backs off and runs
/// the loop again, which reloads everything it needs from the store.
pub(crate) fn spawn(engine: Arc<Engine>, id: Uuid) {
    if !engine.active.claim(id) {
        tracing::debug!(execution_id = %id, "Run loop already active; requested another pass");
        return;
    }
    tokio::spawn(async move {
        let mut delay = engine.settings.write_backoff;
        loop {
            match run(&engine, id).await {
                Ok(()) => {
                    if engine.active.release(id) {
                        return;
                    }
                    delay = engine.settings.write_backoff;
                }
                Err(e) => {
                    tracing::error!(
                        execution_id = %id,
                        "Run loop interrupted, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, engine.settings.write_backoff_max);
                }
            }
        }
    });
}

/// Drive the execution until it leaves RUNNING.
///
/// Returns `Err` only for infrastructure failures outside the audit write;
/// the execution then stays RUNNING and [`spawn`] drives it again.
pub(crate) async fn run(engine: &Arc<Engine>, id: Uuid) -> Result<(), String> {
    loop {
        let Some(execution) = engine.store.get_execution(id).await? else {
            tracing::warn!(execution_id = %id, "Execution vanished; run loop exiting");
            return Ok(());
        };
        if execution.status != ExecutionStatus::Running {
            tracing::debug!(execution_id = %id, status = %execution.status, "Not running; run loop exiting");
            return Ok(());
        }

        if execution.cancel_requested {
            finish(engine, id, ExecutionStatus::Stopped, "Cancelled by request").await?;
            return Ok(());
        }

        let history = match ActionHistory::from_records(engine.store.get_actions(id).await?) {
            Ok(history) => history,
            Err(e) => {
                finish(engine, id, ExecutionStatus::Failed, &format!("Corrupt audit log: {}", e))
                    .await?;
                return Ok(());
            }
        };

        // Crashed between recording the approval request and suspending
        if let Some(ticket) = unsuspended_ticket(&history) {
            suspend(engine, &execution, &ticket).await?;
            return Ok(());
        }

        let action = match execution.agent_type.plan(&execution.goal, &history) {
            Plan::Done { result } => {
                finish(engine, id, ExecutionStatus::Succeeded, &result).await?;
                return Ok(());
            }
            Plan::Abort { reason } => {
                finish(engine, id, ExecutionStatus::Failed, &reason).await?;
                return Ok(());
            }
            Plan::Next(action) => action,
        };

        let check = BudgetTracker::new(execution.config)
            .check(execution.current_iteration, execution.total_cost);
        if let Some(reason) = check.reason() {
            finish(engine, id, ExecutionStatus::BudgetExceeded, &reason).await?;
            return Ok(());
        }

        let Some(tool) = engine.tools.get(&action.action_type) else {
            let reason = format!(
                "Configuration error: no tool registered for action '{}'",
                action.action_type
            );
            finish(engine, id, ExecutionStatus::Failed, &reason).await?;
            return Ok(());
        };

        let iteration = execution.current_iteration;
        tracing::debug!(
            execution_id = %id,
            iteration,
            action = %action.action_type,
            "Executing action"
        );
        let ctx = ToolContext {
            execution_id: id,
            iteration,
            working_dir: engine.settings.working_dir.clone(),
        };
        let (outcome, duration_ms) = tools::invoke(
            tool.as_ref(),
            &action.parameters,
            &ctx,
            engine.settings.tool_timeout,
        )
        .await;

        let record = ActionRecord {
            execution_id: id,
            iteration,
            action_type: action.action_type,
            input: action.parameters,
            output: outcome.output,
            success: outcome.success,
            error_message: outcome.error_message,
            cost_units: outcome.cost_units,
            duration_ms,
            recorded_at: now_string(),
        };

        let updated = match append_with_retry(engine, &record).await {
            AppendOutcome::Appended(updated) => updated,
            AppendOutcome::Rejected(reason) => {
                tracing::warn!(
                    execution_id = %id,
                    iteration,
                    action = %record.action_type,
                    "Action record rejected: {}",
                    reason
                );
                return Ok(());
            }
        };

        if record.success && record.action_type == keys::REQUEST_APPROVAL {
            match record.output_str("ticket_id") {
                Some(ticket) => suspend(engine, &updated, ticket).await?,
                None => {
                    finish(
                        engine,
                        id,
                        ExecutionStatus::Failed,
                        "Approval request returned no ticket id",
                    )
                    .await?;
                }
            }
            return Ok(());
        }
    }
}

/// Guarded RUNNING → `to`.
async fn finish(
    engine: &Engine,
    id: Uuid,
    to: ExecutionStatus,
    result: &str,
) -> Result<(), String> {
    if engine
        .store
        .transition(id, ExecutionStatus::Running, to, Some(result))
        .await?
    {
        tracing::info!(execution_id = %id, status = %to, result = %result, "Execution finished");
    } else {
        tracing::warn!(execution_id = %id, status = %to, "Transition skipped; execution left RUNNING first");
    }
    Ok(())
}

/// Ticket of a successful approval request that is the last record, i.e.
/// one the execution never suspended on.
fn unsuspended_ticket(history: &ActionHistory) -> Option<String> {
    history
        .last()
        .filter(|r| r.success && r.action_type == keys::REQUEST_APPROVAL)
        .and_then(|r| r.output_str("ticket_id"))
        .map(str::to_string)
}

/// Persist WAITING_FOR_APPROVAL and arm the timeout. The loop task ends
/// after this; the resume handler or the timer takes over.
async fn suspend(engine: &Arc<Engine>, execution: &Execution, ticket: &str) -> Result<(), String> {
    let timeout_secs = execution.config.approval_timeout_secs;
    let deadline = i64::try_from(timeout_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|timeout| Utc::now().checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let outcome = engine
        .store
        .suspend_for_approval(execution.id, ticket, &deadline.to_rfc3339())
        .await?;
    match outcome {
        SuspendOutcome::Suspended => {
            tracing::info!(
                execution_id = %execution.id,
                ticket_id = %ticket,
                timeout_secs,
                "Waiting for approval"
            );
            resume::arm_timer(
                engine.clone(),
                execution.id,
                ticket.to_string(),
                Duration::from_secs(timeout_secs),
            );
        }
        SuspendOutcome::Stopped => {
            tracing::info!(execution_id = %execution.id, "Cancelled before suspension");
            if let Err(e) = engine.approvals.expire(ticket).await {
                tracing::warn!(ticket_id = %ticket, "Failed to expire ticket: {}", e);
            }
        }
        SuspendOutcome::NotRunning => {
            tracing::debug!(execution_id = %execution.id, "Suspension skipped; not running");
        }
    }
    Ok(())
}

/// Append until the store accepts or rejects the record.
///
/// The tool has already run, so its record and cost must land before the
/// loop goes any further. Store errors are retried with exponential backoff
/// capped at `write_backoff_max`; guard rejections are returned at once.
async fn append_with_retry(engine: &Engine, record: &ActionRecord) -> AppendOutcome {
    let mut attempt = 0u32;
    let mut delay = engine.settings.write_backoff;
    loop {
        match engine.store.append_action(record).await {
            Ok(outcome) => {
                if attempt > 0 {
                    tracing::info!(
                        execution_id = %record.execution_id,
                        iteration = record.iteration,
                        attempt,
                        "Audit write recovered"
                    );
                }
                return outcome;
            }
            Err(e) => {
                attempt += 1;
                if delay >= engine.settings.write_backoff_max {
                    let unrecorded = serde_json::to_string(record).unwrap_or_default();
                    tracing::error!(
                        execution_id = %record.execution_id,
                        iteration = record.iteration,
                        attempt,
                        record = %unrecorded,
                        "Audit write still failing, retrying in {:?}: {}",
                        delay,
                        e
                    );
                } else {
                    tracing::warn!(
                        execution_id = %record.execution_id,
                        iteration = record.iteration,
                        attempt,
                        "Audit write failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                }
                tokio::time::sleep(delay).await;
                delay = next_backoff(delay, engine.settings.write_backoff_max);
            }
        }
    }
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
