//! Core execution types: goals, budgets, the execution row and its audit records.
//!
//! # Invariants
//! - `total_actions == count(ActionRecords)`
//! - `current_iteration == max(ActionRecord.iteration) + 1` (0 if none)
//! - `total_cost == sum(ActionRecord.cost_units)`
//! - A terminal status is a sink

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agents::AgentType;

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Status of an execution in its lifecycle.
///
/// # State Machine
/// ```text
/// Running -> WaitingForApproval -> Running
///         |                     \-> Failed | Timeout | Stopped
///         \-> Succeeded | Failed | Stopped | BudgetExceeded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    WaitingForApproval,
    Succeeded,
    Failed,
    Stopped,
    Timeout,
    BudgetExceeded,
}

impl ExecutionStatus {
    /// `true` for statuses no transition may leave.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::WaitingForApproval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::WaitingForApproval => "WAITING_FOR_APPROVAL",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Timeout => "TIMEOUT",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "WAITING_FOR_APPROVAL" => Ok(Self::WaitingForApproval),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            "TIMEOUT" => Ok(Self::Timeout),
            "BUDGET_EXCEEDED" => Ok(Self::BudgetExceeded),
            other => Err(format!("Unknown execution status '{}'", other)),
        }
    }
}

/// What an execution must accomplish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Goal type, matched against the agent type at start
    #[serde(default)]
    pub goal_type: String,
    /// Free-form scalar parameters (story key, file paths, commands, ...)
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub requesting_identity: String,
}

impl Goal {
    pub fn new(goal_type: impl Into<String>) -> Self {
        Self {
            goal_type: goal_type.into(),
            parameters: Map::new(),
            success_criteria: String::new(),
            requesting_identity: String::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.parameters.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Parameters must be scalars so every tool can consume them untyped.
    pub fn validate(&self) -> Result<(), String> {
        for (key, value) in &self.parameters {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                return Err(format!("Goal parameter '{}' must be a scalar", key));
            }
        }
        Ok(())
    }
}

/// Budget and approval settings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_iterations: u32,
    pub max_cost_units: u64,
    pub approval_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_cost_units: 500,
            approval_timeout_secs: 24 * 60 * 60,
        }
    }
}

/// One agent run: the only shared mutable resource of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub status: ExecutionStatus,
    pub goal: Goal,
    pub config: ExecutionConfig,
    pub current_iteration: u32,
    pub total_actions: u64,
    pub total_cost: u64,
    pub requested_by: String,
    pub started_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Ticket the execution is suspended on (only while WaitingForApproval)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_ticket: Option<String>,
    /// Instant at which a pending approval times out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_deadline: Option<String>,
    /// Cooperative STOP flag, observed at the top of each iteration
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Execution {
    /// Create a fresh execution in Running state with no recorded actions.
    pub fn new(
        agent_type: AgentType,
        goal: Goal,
        config: ExecutionConfig,
        requested_by: impl Into<String>,
    ) -> Self {
        let now = now_string();
        Self {
            id: Uuid::new_v4(),
            agent_type,
            status: ExecutionStatus::Running,
            goal,
            config,
            current_iteration: 0,
            total_actions: 0,
            total_cost: 0,
            requested_by: requested_by.into(),
            started_at: now.clone(),
            updated_at: now,
            completed_at: None,
            result: None,
            pending_ticket: None,
            approval_deadline: None,
            cancel_requested: false,
        }
    }
}

/// One tool invocation plus its recorded outcome. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub execution_id: Uuid,
    pub iteration: u32,
    pub action_type: String,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub cost_units: u64,
    pub duration_ms: u64,
    pub recorded_at: String,
}

impl ActionRecord {
    /// Read a string field from the recorded output.
    pub fn output_str(&self, key: &str) -> Option<&str> {
        self.output.get(key).and_then(|v| v.as_str())
    }

    pub fn output_bool(&self, key: &str) -> Option<bool> {
        self.output.get(key).and_then(|v| v.as_bool())
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(|v| v.as_str())
    }
}
