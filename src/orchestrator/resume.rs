//! Resume protocol: decisions and timeouts racing for a waiting execution.
//!
//! Both paths end in one guarded `resolve_approval` write ("only if still
//! WAITING_FOR_APPROVAL on this ticket"); whichever lands first wins and the
//! other observes a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::run_loop;
use super::Engine;
use crate::agents::policy;
use crate::approval::DecisionEvent;
use crate::execution::{now_string, ActionRecord, Execution, ExecutionStatus};
use crate::tools::keys;

/// Sole consumer of the decision channel. Exits when every sender is gone.
pub(crate) async fn handle_decisions(engine: Arc<Engine>, mut rx: mpsc::Receiver<DecisionEvent>) {
    while let Some(decision) = rx.recv().await {
        if let Err(e) = apply_decision(&engine, &decision).await {
            tracing::error!(ticket_id = %decision.ticket_id, "Failed to apply decision: {}", e);
        }
    }
    tracing::debug!("Decision channel closed; resume handler exiting");
}

/// Fold a decision into the waiting execution and, if approved, re-enter
/// the run loop. Returns whether this call applied the transition.
///
/// Idempotent: a redelivered or late decision finds no execution waiting on
/// the ticket and does nothing.
pub(crate) async fn apply_decision(
    engine: &Arc<Engine>,
    decision: &DecisionEvent,
) -> Result<bool, String> {
    let Some(execution) = engine.store.find_by_pending_ticket(&decision.ticket_id).await? else {
        tracing::debug!(
            ticket_id = %decision.ticket_id,
            "No execution waiting on ticket; decision ignored"
        );
        return Ok(false);
    };

    let record = decision_record(&execution, decision);
    let (to, result) = if decision.approved {
        (ExecutionStatus::Running, None)
    } else {
        (ExecutionStatus::Failed, Some(policy::rejection_reason(&record)))
    };

    let applied = engine
        .store
        .resolve_approval(
            execution.id,
            &decision.ticket_id,
            Some(&record),
            to,
            result.as_deref(),
        )
        .await?;
    if !applied {
        tracing::debug!(
            execution_id = %execution.id,
            ticket_id = %decision.ticket_id,
            "Decision lost the race; no-op"
        );
        return Ok(false);
    }

    tracing::info!(
        execution_id = %execution.id,
        ticket_id = %decision.ticket_id,
        approved = decision.approved,
        reviewer = %decision.reviewer,
        "Approval decision applied"
    );
    if decision.approved {
        run_loop::spawn(engine.clone(), execution.id);
    }
    Ok(true)
}

/// The zero-cost record that carries a decision into the audit log.
fn decision_record(execution: &Execution, decision: &DecisionEvent) -> ActionRecord {
    let mut input = Map::new();
    input.insert("ticket_id".to_string(), json!(decision.ticket_id));

    let mut output = Map::new();
    output.insert("ticket_id".to_string(), json!(decision.ticket_id));
    output.insert("approved".to_string(), json!(decision.approved));
    output.insert("reviewer".to_string(), json!(decision.reviewer));
    if let Some(notes) = &decision.notes {
        output.insert("notes".to_string(), json!(notes));
    }

    ActionRecord {
        execution_id: execution.id,
        iteration: execution.current_iteration,
        action_type: keys::APPROVAL_DECISION.to_string(),
        input,
        output,
        success: decision.approved,
        error_message: (!decision.approved).then(|| "Approval rejected".to_string()),
        cost_units: 0,
        duration_ms: 0,
        recorded_at: now_string(),
    }
}

/// Start the approval timer for a suspended execution.
pub(crate) fn arm_timer(engine: Arc<Engine>, id: Uuid, ticket: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = expire(&engine, id, &ticket).await {
            tracing::error!(execution_id = %id, ticket_id = %ticket, "Approval timeout failed: {}", e);
        }
    });
}

/// WAITING_FOR_APPROVAL → TIMEOUT, if nothing else got there first.
pub(crate) async fn expire(engine: &Engine, id: Uuid, ticket: &str) -> Result<bool, String> {
    let applied = engine
        .store
        .resolve_approval(
            id,
            ticket,
            None,
            ExecutionStatus::Timeout,
            Some("Approval timed out"),
        )
        .await?;
    if applied {
        tracing::info!(execution_id = %id, ticket_id = %ticket, "Approval timed out");
        if let Err(e) = engine.approvals.expire(ticket).await {
            tracing::warn!(ticket_id = %ticket, "Failed to expire ticket: {}", e);
        }
    } else {
        tracing::debug!(execution_id = %id, ticket_id = %ticket, "Timer fired after resolution; no-op");
    }
    Ok(applied)
}

/// Time left until `deadline`; zero when it passed or cannot be parsed.
pub(crate) fn remaining(deadline: Option<&str>) -> Duration {
    deadline
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .and_then(|d| (d.with_timezone(&Utc) - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
