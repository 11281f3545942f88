//! End-to-end run-loop scenarios with scripted tools under the real action
//! keys. No network, no git, no shell.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use super::*;
use crate::approval::{InMemoryApprovalStore, TicketStatus};
use crate::execution::ActionHistory;
use crate::store::{AppendOutcome, InMemoryExecutionStore, SuspendOutcome};
use crate::tools::{keys, RequestApproval, Tool, ToolContext, ToolOutput};

/// Returns a fixed output, optionally failing its first `failures` calls.
struct Scripted {
    key: &'static str,
    output: Value,
    cost: u64,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl Scripted {
    fn new(key: &'static str, output: Value) -> Self {
        Self {
            key,
            output,
            cost: 0,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    fn failing(self, times: u32) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for Scripted {
    fn name(&self) -> &str {
        self.key
    }

    fn description(&self) -> &str {
        "scripted"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _: &Map<String, Value>, _: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("{} scripted failure", self.key);
        }
        Ok(ToolOutput::from_json(self.output.clone()).with_cost(self.cost))
    }
}

/// Blocks inside `execute` until released.
struct Gate {
    key: &'static str,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Tool for Gate {
    fn name(&self) -> &str {
        self.key
    }

    fn description(&self) -> &str {
        "gated"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _: &Map<String, Value>, _: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(ToolOutput::from_json(json!({ "passed": true, "exit_code": 0, "stdout": "ok" })))
    }
}

/// Execution store whose appends fail a configurable number of times.
struct FlakyStore {
    inner: InMemoryExecutionStore,
    append_failures: AtomicU32,
    append_attempts: AtomicU32,
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    fn is_persistent(&self) -> bool {
        false
    }
    async fn create_execution(&self, execution: &Execution) -> Result<(), String> {
        self.inner.create_execution(execution).await
    }
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, String> {
        self.inner.get_execution(id).await
    }
    async fn list_executions(&self, limit: usize, offset: usize) -> Result<Vec<Execution>, String> {
        self.inner.list_executions(limit, offset).await
    }
    async fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>, String> {
        self.inner.list_by_status(status).await
    }
    async fn find_by_pending_ticket(&self, ticket_id: &str) -> Result<Option<Execution>, String> {
        self.inner.find_by_pending_ticket(ticket_id).await
    }
    async fn get_actions(&self, id: Uuid) -> Result<Vec<ActionRecord>, String> {
        self.inner.get_actions(id).await
    }
    async fn append_action(&self, record: &ActionRecord) -> Result<AppendOutcome, String> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.append_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.append_failures.store(remaining - 1, Ordering::SeqCst);
            return Err("disk I/O error".to_string());
        }
        self.inner.append_action(record).await
    }
    async fn transition(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        self.inner.transition(id, from, to, result).await
    }
    async fn suspend_for_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        deadline: &str,
    ) -> Result<SuspendOutcome, String> {
        self.inner.suspend_for_approval(id, ticket_id, deadline).await
    }
    async fn resolve_approval(
        &self,
        id: Uuid,
        ticket_id: &str,
        decision: Option<&ActionRecord>,
        to: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<bool, String> {
        self.inner.resolve_approval(id, ticket_id, decision, to, result).await
    }
    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, String> {
        self.inner.request_cancel(id).await
    }
}

struct Harness {
    orchestrator: Orchestrator,
    approvals: Arc<InMemoryApprovalStore>,
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        working_dir: std::env::temp_dir(),
        tool_timeout: Duration::from_secs(5),
        write_backoff: Duration::from_millis(1),
        write_backoff_max: Duration::from_millis(4),
        default_config: ExecutionConfig::default(),
    }
}

fn harness_with_store(store: Arc<dyn ExecutionStore>, tools: Vec<Arc<dyn Tool>>) -> Harness {
    let approvals = Arc::new(InMemoryApprovalStore::new());
    let mut registry = ToolRegistry::empty();
    registry
        .register(Arc::new(RequestApproval::new(approvals.clone())))
        .unwrap();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    let orchestrator = Orchestrator::new(store, registry, approvals.clone(), settings());
    Harness {
        orchestrator,
        approvals,
    }
}

fn harness(tools: Vec<Arc<dyn Tool>>) -> Harness {
    harness_with_store(Arc::new(InMemoryExecutionStore::new()), tools)
}

fn monitor_goal() -> Goal {
    Goal::new("monitor_quality")
        .with_param("test_command", "npm test")
        .with_param("report_path", "report.md")
}

fn generator_goal() -> Goal {
    Goal::new("generate_tests")
        .with_param("story_key", "QA-1")
        .with_param("output_path", "tests/qa-1.spec.ts")
}

fn monitor_tools() -> (Arc<Scripted>, Arc<Scripted>, Arc<Scripted>) {
    (
        Arc::new(Scripted::new(
            keys::RUN_TESTS,
            json!({ "passed": false, "exit_code": 1, "stdout": "1 failed", "stderr": "" }),
        )),
        Arc::new(Scripted::new(keys::CALL_AI, json!({ "content": "# Report" })).cost(4)),
        Arc::new(Scripted::new(keys::WRITE_FILE, json!({ "path": "report.md" }))),
    )
}

fn generator_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(Scripted::new(
            keys::FETCH_STORY,
            json!({ "story_key": "QA-1", "summary": "Login", "description": "As a user", "acceptance_criteria": "works" }),
        )),
        Arc::new(Scripted::new(keys::CALL_AI, json!({ "content": "test('login', () => {})" })).cost(3)),
        Arc::new(Scripted::new(keys::WRITE_FILE, json!({ "path": "tests/qa-1.spec.ts" }))),
        Arc::new(Scripted::new(keys::GIT_CREATE_BRANCH, json!({ "branch": "qa/QA-1" }))),
        Arc::new(Scripted::new(keys::GIT_COMMIT, json!({ "commit": "abc123" }))),
    ]
}

fn config(max_iterations: u32, max_cost_units: u64) -> ExecutionConfig {
    ExecutionConfig {
        max_iterations,
        max_cost_units,
        ..ExecutionConfig::default()
    }
}

async fn wait_for(orchestrator: &Orchestrator, id: Uuid, want: ExecutionStatus) -> Execution {
    let mut last = None;
    for _ in 0..500 {
        let execution = orchestrator.get_status(id).await.unwrap();
        if execution.status == want {
            return execution;
        }
        last = Some(execution.status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached {} (last {:?})", id, want, last);
}

/// Counter and ordering invariants that must hold in every reachable state.
async fn assert_consistent(orchestrator: &Orchestrator, id: Uuid) -> Vec<ActionRecord> {
    let execution = orchestrator.get_status(id).await.unwrap();
    let actions = orchestrator.get_actions(id).await.unwrap();
    assert_eq!(execution.total_cost, actions.iter().map(|a| a.cost_units).sum::<u64>());
    assert_eq!(execution.total_actions, actions.len() as u64);
    assert_eq!(execution.current_iteration as usize, actions.len());
    assert!(ActionHistory::from_records(actions.clone()).is_ok());
    actions
}

fn decision(ticket_id: &str, approved: bool) -> DecisionEvent {
    DecisionEvent {
        ticket_id: ticket_id.to_string(),
        approved,
        reviewer: "bob".to_string(),
        notes: (!approved).then(|| "asserts are too weak".to_string()),
    }
}

#[tokio::test]
async fn test_unknown_agent_type_creates_nothing() {
    let h = harness(vec![]);
    let err = h
        .orchestrator
        .start("release_manager", monitor_goal(), None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Configuration(_)));
    assert!(h.orchestrator.list(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_goal_rejected_at_start() {
    let h = harness(vec![]);
    let goal = Goal::new("generate_tests").with_param("story_key", "QA-1");
    let err = h
        .orchestrator
        .start("test_generator", goal, None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidGoal(_)));
}

#[tokio::test]
async fn test_execution_is_queryable_when_start_returns() {
    let h = harness(vec![]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();
    let execution = h.orchestrator.get_status(id).await.unwrap();
    assert_eq!(execution.requested_by, "alice");
    assert!(matches!(
        h.orchestrator.get_status(Uuid::new_v4()).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_generator_runs_through_approval_to_success() {
    let h = harness(generator_tools());
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), None, "alice")
        .await
        .unwrap();

    let waiting = wait_for(&h.orchestrator, id, ExecutionStatus::WaitingForApproval).await;
    let ticket = waiting.pending_ticket.clone().unwrap();
    assert!(waiting.approval_deadline.is_some());
    assert_eq!(h.approvals.list_pending().await.unwrap().len(), 1);
    assert_eq!(assert_consistent(&h.orchestrator, id).await.len(), 4);

    h.orchestrator.decide(decision(&ticket, true)).await.unwrap();
    let done = wait_for(&h.orchestrator, id, ExecutionStatus::Succeeded).await;
    assert!(done.result.unwrap().contains("abc123"));
    assert!(done.completed_at.is_some());

    let actions = assert_consistent(&h.orchestrator, id).await;
    let kinds: Vec<&str> = actions.iter().map(|a| a.action_type.as_str()).collect();
    assert_eq!(
        kinds,
        [
            keys::FETCH_STORY,
            keys::CALL_AI,
            keys::WRITE_FILE,
            keys::REQUEST_APPROVAL,
            keys::APPROVAL_DECISION,
            keys::GIT_CREATE_BRANCH,
            keys::GIT_COMMIT,
        ]
    );
    assert_eq!(actions[4].output["reviewer"], json!("bob"));
    assert_eq!(done.total_cost, 3);
}

#[tokio::test]
async fn test_iteration_ceiling_of_one() {
    let (run, ai, write) = monitor_tools();
    let h = harness(vec![run.clone(), ai, write]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), Some(config(1, 500)), "alice")
        .await
        .unwrap();

    let execution = wait_for(&h.orchestrator, id, ExecutionStatus::BudgetExceeded).await;
    assert!(execution.result.unwrap().contains("iteration"));
    assert_eq!(assert_consistent(&h.orchestrator, id).await.len(), 1);
    assert_eq!(run.calls(), 1);
}

#[tokio::test]
async fn test_zero_cost_ceiling_records_first_metered_call() {
    let (run, ai, write) = monitor_tools();
    let h = harness(vec![run, ai.clone(), write.clone()]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), Some(config(20, 0)), "alice")
        .await
        .unwrap();

    let execution = wait_for(&h.orchestrator, id, ExecutionStatus::BudgetExceeded).await;
    assert_eq!(execution.total_cost, 4);
    let actions = assert_consistent(&h.orchestrator, id).await;
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1].action_type, keys::CALL_AI);
    assert_eq!(ai.calls(), 1);
    assert_eq!(write.calls(), 0);
}

#[tokio::test]
async fn test_goal_completed_by_last_affordable_action_succeeds() {
    let (run, ai, write) = monitor_tools();
    let h = harness(vec![run, ai, write]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), Some(config(3, 4)), "alice")
        .await
        .unwrap();

    let execution = wait_for(&h.orchestrator, id, ExecutionStatus::Succeeded).await;
    assert_eq!(execution.current_iteration, 3);
    assert!(execution.result.unwrap().contains("report.md"));
}

#[tokio::test]
async fn test_rejection_fails_and_late_timer_is_noop() {
    let h = harness(generator_tools());
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), None, "alice")
        .await
        .unwrap();
    let waiting = wait_for(&h.orchestrator, id, ExecutionStatus::WaitingForApproval).await;
    let ticket = waiting.pending_ticket.unwrap();

    h.orchestrator.decide(decision(&ticket, false)).await.unwrap();
    let failed = wait_for(&h.orchestrator, id, ExecutionStatus::Failed).await;
    assert_eq!(
        failed.result.as_deref(),
        Some("Rejected by bob: asserts are too weak")
    );

    let fired = resume::expire(&h.orchestrator.engine, id, &ticket).await.unwrap();
    assert!(!fired);
    let after = h.orchestrator.get_status(id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Failed);
    let actions = assert_consistent(&h.orchestrator, id).await;
    assert_eq!(actions.last().unwrap().action_type, keys::APPROVAL_DECISION);
    assert!(!actions.last().unwrap().success);
}

#[tokio::test]
async fn test_decision_and_timeout_race_has_exactly_one_winner() {
    for _ in 0..10 {
        let h = harness(generator_tools());
        let id = h
            .orchestrator
            .start("test_generator", generator_goal(), None, "alice")
            .await
            .unwrap();
        let waiting = wait_for(&h.orchestrator, id, ExecutionStatus::WaitingForApproval).await;
        let ticket = waiting.pending_ticket.unwrap();
        let engine = &h.orchestrator.engine;

        let verdict = decision(&ticket, true);
        let (approved, timed_out) = tokio::join!(
            resume::apply_decision(engine, &verdict),
            resume::expire(engine, id, &ticket)
        );
        assert!(approved.unwrap() ^ timed_out.unwrap());

        let status = h.orchestrator.get_status(id).await.unwrap().status;
        assert_ne!(status, ExecutionStatus::WaitingForApproval);
        assert_consistent(&h.orchestrator, id).await;
    }
}

#[tokio::test]
async fn test_approval_timeout_expires_ticket() {
    let h = harness(generator_tools());
    let cfg = ExecutionConfig {
        approval_timeout_secs: 0,
        ..ExecutionConfig::default()
    };
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), Some(cfg), "alice")
        .await
        .unwrap();

    let execution = wait_for(&h.orchestrator, id, ExecutionStatus::Timeout).await;
    assert!(execution.pending_ticket.is_none());
    let actions = assert_consistent(&h.orchestrator, id).await;
    let ticket_id = actions[3].output_str("ticket_id").unwrap();
    // The ticket is expired right after the status write
    let mut status = TicketStatus::Pending;
    for _ in 0..100 {
        status = h.orchestrator.get_ticket(ticket_id).await.unwrap().status;
        if status == TicketStatus::Expired {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, TicketStatus::Expired);
}

#[tokio::test]
async fn test_redelivered_decision_is_ignored() {
    let h = harness(generator_tools());
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), None, "alice")
        .await
        .unwrap();
    let ticket = wait_for(&h.orchestrator, id, ExecutionStatus::WaitingForApproval)
        .await
        .pending_ticket
        .unwrap();

    h.orchestrator.decide(decision(&ticket, true)).await.unwrap();
    wait_for(&h.orchestrator, id, ExecutionStatus::Succeeded).await;
    let before = h.orchestrator.get_actions(id).await.unwrap().len();

    let again = resume::apply_decision(&h.orchestrator.engine, &decision(&ticket, true))
        .await
        .unwrap();
    assert!(!again);
    // Same verdict on the ticket is accepted again
    h.orchestrator.decide(decision(&ticket, true)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.orchestrator.get_actions(id).await.unwrap().len(), before);
}

#[tokio::test]
async fn test_cancel_waits_for_in_flight_tool() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = Arc::new(Gate {
        key: keys::RUN_TESTS,
        started: started.clone(),
        release: release.clone(),
    });
    let h = harness(vec![gate]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();

    started.notified().await;
    assert!(h.orchestrator.cancel(id).await.unwrap());
    let mid = h.orchestrator.get_status(id).await.unwrap();
    assert_eq!(mid.status, ExecutionStatus::Running);
    assert!(mid.cancel_requested);

    release.notify_one();
    let stopped = wait_for(&h.orchestrator, id, ExecutionStatus::Stopped).await;
    assert!(stopped.completed_at.is_some());
    let actions = assert_consistent(&h.orchestrator, id).await;
    assert_eq!(actions.len(), 1);
    assert!(actions[0].success);
    assert!(!h.orchestrator.cancel(id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_while_waiting_applies_immediately() {
    let h = harness(generator_tools());
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), None, "alice")
        .await
        .unwrap();
    let ticket = wait_for(&h.orchestrator, id, ExecutionStatus::WaitingForApproval)
        .await
        .pending_ticket
        .unwrap();

    assert!(h.orchestrator.cancel(id).await.unwrap());
    assert_eq!(
        h.orchestrator.get_status(id).await.unwrap().status,
        ExecutionStatus::Stopped
    );
    assert_eq!(
        h.orchestrator.get_ticket(&ticket).await.unwrap().status,
        TicketStatus::Expired
    );
    assert!(matches!(
        h.orchestrator.decide(decision(&ticket, true)).await,
        Err(OrchestratorError::Conflict(_))
    ));
    assert!(!resume::apply_decision(&h.orchestrator.engine, &decision(&ticket, true))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unregistered_tool_fails_fast() {
    let h = harness(vec![]);
    let id = h
        .orchestrator
        .start("test_generator", generator_goal(), None, "alice")
        .await
        .unwrap();
    let failed = wait_for(&h.orchestrator, id, ExecutionStatus::Failed).await;
    assert!(failed.result.unwrap().starts_with("Configuration error"));
    assert!(h.orchestrator.get_actions(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tool_failures_retry_then_abort() {
    let run: Arc<dyn Tool> = monitor_tools().0;
    let ai = Arc::new(Scripted::new(keys::CALL_AI, json!({ "content": "x" })).failing(10));
    let h = harness(vec![run, ai.clone()]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();

    let failed = wait_for(&h.orchestrator, id, ExecutionStatus::Failed).await;
    assert!(failed.result.unwrap().contains("CALL_AI failed 3 times"));
    let actions = assert_consistent(&h.orchestrator, id).await;
    assert_eq!(actions.len(), 4);
    assert!(actions[1..].iter().all(|a| !a.success && a.cost_units == 0));
    assert_eq!(ai.calls(), 3);
}

fn flaky_store(append_failures: u32) -> Arc<FlakyStore> {
    Arc::new(FlakyStore {
        inner: InMemoryExecutionStore::new(),
        append_failures: AtomicU32::new(append_failures),
        append_attempts: AtomicU32::new(0),
    })
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let store = flaky_store(2);
    let (run, ai, write) = monitor_tools();
    let h = harness_with_store(store.clone(), vec![run.clone(), ai, write]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();

    wait_for(&h.orchestrator, id, ExecutionStatus::Succeeded).await;
    assert_eq!(assert_consistent(&h.orchestrator, id).await.len(), 3);
    // The tool ran once; only the write was retried
    assert_eq!(run.calls(), 1);
}

#[tokio::test]
async fn test_cancel_after_failed_writes_keeps_the_record() {
    let store = flaky_store(3);
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = Arc::new(Gate {
        key: keys::RUN_TESTS,
        started: started.clone(),
        release: release.clone(),
    });
    let h = harness_with_store(store.clone(), vec![gate]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();

    started.notified().await;
    assert!(h.orchestrator.cancel(id).await.unwrap());
    release.notify_one();

    let stopped = wait_for(&h.orchestrator, id, ExecutionStatus::Stopped).await;
    assert_eq!(stopped.result.as_deref(), Some("Cancelled by request"));
    let actions = assert_consistent(&h.orchestrator, id).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, keys::RUN_TESTS);
    assert_eq!(store.append_attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_write_outage_blocks_loop_until_record_lands() {
    let store = flaky_store(40);
    let (run, ai, write) = monitor_tools();
    let h = harness_with_store(store.clone(), vec![run.clone(), ai.clone(), write]);
    let id = h
        .orchestrator
        .start("quality_monitor", monitor_goal(), None, "alice")
        .await
        .unwrap();

    for _ in 0..200 {
        if store.append_attempts.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // No further tool runs while the first record is unwritten
    assert_eq!(run.calls(), 1);
    assert_eq!(ai.calls(), 0);
    assert!(h.orchestrator.get_actions(id).await.unwrap().is_empty());
    assert!(h.orchestrator.cancel(id).await.unwrap());

    let stopped = wait_for(&h.orchestrator, id, ExecutionStatus::Stopped).await;
    assert_eq!(stopped.total_actions, 1);
    assert_eq!(assert_consistent(&h.orchestrator, id).await.len(), 1);
    assert_eq!(run.calls(), 1);
    assert_eq!(ai.calls(), 0);
    assert_eq!(store.append_attempts.load(Ordering::SeqCst), 41);
}

#[tokio::test]
async fn test_recover_resumes_running_from_history() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let execution = Execution::new(
        AgentType::QualityMonitor,
        monitor_goal(),
        ExecutionConfig::default(),
        "alice",
    );
    store.create_execution(&execution).await.unwrap();
    let mut output = Map::new();
    output.insert("passed".to_string(), json!(true));
    output.insert("exit_code".to_string(), json!(0));
    store
        .append_action(&ActionRecord {
            execution_id: execution.id,
            iteration: 0,
            action_type: keys::RUN_TESTS.to_string(),
            input: Map::new(),
            output,
            success: true,
            error_message: None,
            cost_units: 0,
            duration_ms: 10,
            recorded_at: crate::execution::now_string(),
        })
        .await
        .unwrap();

    let (run, ai, write) = monitor_tools();
    let h = harness_with_store(store, vec![run.clone(), ai, write]);
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);

    let done = wait_for(&h.orchestrator, execution.id, ExecutionStatus::Succeeded).await;
    assert!(done.result.unwrap().contains("passing"));
    assert_eq!(run.calls(), 0);
    assert_eq!(assert_consistent(&h.orchestrator, execution.id).await.len(), 3);
}

#[tokio::test]
async fn test_recover_times_out_overdue_approvals() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let execution = Execution::new(
        AgentType::QualityMonitor,
        monitor_goal(),
        ExecutionConfig::default(),
        "alice",
    );
    store.create_execution(&execution).await.unwrap();
    store
        .suspend_for_approval(execution.id, "apr-old", "2001-01-01T00:00:00+00:00")
        .await
        .unwrap();

    let h = harness_with_store(store, vec![]);
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);
    let timed_out = wait_for(&h.orchestrator, execution.id, ExecutionStatus::Timeout).await;
    assert_eq!(timed_out.result.as_deref(), Some("Approval timed out"));
}

#[tokio::test]
async fn test_recover_suspends_unsuspended_approval_request() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let execution = Execution::new(
        AgentType::TestGenerator,
        generator_goal(),
        ExecutionConfig::default(),
        "alice",
    );
    store.create_execution(&execution).await.unwrap();
    let mut output = Map::new();
    output.insert("ticket_id".to_string(), json!("apr-crash"));
    store
        .append_action(&ActionRecord {
            execution_id: execution.id,
            iteration: 0,
            action_type: keys::REQUEST_APPROVAL.to_string(),
            input: Map::new(),
            output,
            success: true,
            error_message: None,
            cost_units: 0,
            duration_ms: 1,
            recorded_at: crate::execution::now_string(),
        })
        .await
        .unwrap();

    let h = harness_with_store(store, generator_tools());
    h.orchestrator.recover().await.unwrap();
    let waiting = wait_for(&h.orchestrator, execution.id, ExecutionStatus::WaitingForApproval).await;
    assert_eq!(waiting.pending_ticket.as_deref(), Some("apr-crash"));
    assert_eq!(assert_consistent(&h.orchestrator, execution.id).await.len(), 1);
}

#[tokio::test]
async fn test_recover_twice_drives_each_execution_once() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let execution = Execution::new(
        AgentType::QualityMonitor,
        monitor_goal(),
        ExecutionConfig::default(),
        "alice",
    );
    store.create_execution(&execution).await.unwrap();

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = Arc::new(Gate {
        key: keys::RUN_TESTS,
        started: started.clone(),
        release: release.clone(),
    });
    let (_, ai, write) = monitor_tools();
    let h = harness_with_store(store, vec![gate, ai.clone(), write]);

    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);
    started.notified().await;
    // The loop is parked inside the tool; a second recovery must not start another
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);
    release.notify_one();

    wait_for(&h.orchestrator, execution.id, ExecutionStatus::Succeeded).await;
    let actions = assert_consistent(&h.orchestrator, execution.id).await;
    assert_eq!(actions.len(), 3);
    assert_eq!(ai.calls(), 1);
}
