//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionConfig, ExecutionStatus, Goal};
use crate::tools::ToolInfo;

/// Request to start an execution.
#[derive(Debug, Clone, Deserialize)]
pub struct StartExecutionRequest {
    /// Agent type, e.g. `test_generator`
    pub agent_type: String,

    pub goal: Goal,

    /// Optional per-execution budget; unset fields use the server defaults
    #[serde(default)]
    pub config: Option<ConfigOverrides>,

    /// Who asked for the run (recorded on the execution)
    pub requester: String,
}

/// Partial [`ExecutionConfig`] supplied by a caller.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ConfigOverrides {
    pub max_iterations: Option<u32>,
    pub max_cost_units: Option<u64>,
    pub approval_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(self, defaults: ExecutionConfig) -> ExecutionConfig {
        ExecutionConfig {
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            max_cost_units: self.max_cost_units.unwrap_or(defaults.max_cost_units),
            approval_timeout_secs: self
                .approval_timeout_secs
                .unwrap_or(defaults.approval_timeout_secs),
        }
    }
}

/// Response after starting an execution.
#[derive(Debug, Clone, Serialize)]
pub struct StartExecutionResponse {
    pub id: Uuid,
    pub status: ExecutionStatus,
}

/// Pagination for list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// A reviewer's verdict on a ticket.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub approved: bool,
    pub reviewer: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether executions survive a restart
    pub persistent: bool,

    /// Default budget applied to new executions
    pub default_config: ExecutionConfig,

    /// Registered tools
    pub tools: Vec<ToolInfo>,
}
