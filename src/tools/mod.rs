//! Tool system for the orchestrator.
//!
//! A tool is the single entry point to one external capability (AI calls,
//! version control, file writes, the issue tracker, ...). Tools are keyed by
//! the action type planners emit, so the registry is a plain map from action
//! key to implementation.
//!
//! ## Workspace-First Design
//!
//! File, git and test tools work relative to the workspace by default:
//! - Relative paths (e.g., `tests/login.spec.ts`) resolve from the workspace
//! - Absolute paths are used as-is

mod ai;
mod approval;
mod file_ops;
mod git;
mod locator;
mod story;
mod terminal;

pub use ai::CallAi;
pub use approval::RequestApproval;
pub use file_ops::{ReadFile, WriteFile};
pub use git::{GitCommit, GitCreateBranch};
pub use locator::LookupLocator;
pub use story::{FetchStory, IssueTracker};
pub use terminal::RunTests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::approval::ApprovalStore;
use crate::llm::LlmClient;

/// Action-type keys. Planners emit these; the registry resolves them.
pub mod keys {
    pub const FETCH_STORY: &str = "FETCH_STORY";
    pub const CALL_AI: &str = "CALL_AI";
    pub const READ_FILE: &str = "READ_FILE";
    pub const WRITE_FILE: &str = "WRITE_FILE";
    pub const LOOKUP_LOCATOR: &str = "LOOKUP_LOCATOR";
    pub const RUN_TESTS: &str = "RUN_TESTS";
    pub const GIT_CREATE_BRANCH: &str = "GIT_CREATE_BRANCH";
    pub const GIT_COMMIT: &str = "GIT_COMMIT";
    pub const REQUEST_APPROVAL: &str = "REQUEST_APPROVAL";
    /// Written by the resume handler, never dispatched to a tool
    pub const APPROVAL_DECISION: &str = "APPROVAL_DECISION";
}

/// Resolve a path relative to the workspace. Absolute paths are used as-is.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Read a required string parameter.
pub(crate) fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> anyhow::Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", key))
}

/// Where and on whose behalf a tool runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub execution_id: Uuid,
    pub iteration: u32,
    pub working_dir: PathBuf,
}

/// What a tool hands back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub output: Map<String, Value>,
    pub cost_units: u64,
}

impl ToolOutput {
    pub fn new(output: Map<String, Value>) -> Self {
        Self {
            output,
            cost_units: 0,
        }
    }

    /// Build from a `json!({...})` object. Non-object values are wrapped
    /// under `"value"`.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self::new(map)
            }
        }
    }

    pub fn with_cost(mut self, cost_units: u64) -> Self {
        self.cost_units = cost_units;
        self
    }
}

/// Recorded result of one invocation: what goes into the ActionRecord.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Map<String, Value>,
    pub error_message: Option<String>,
    pub cost_units: u64,
}

impl ToolOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Map::new(),
            error_message: Some(message.into()),
            cost_units: 0,
        }
    }
}

impl From<ToolOutput> for ToolOutcome {
    fn from(out: ToolOutput) -> Self {
        Self {
            success: true,
            output: out.output,
            error_message: None,
            cost_units: out.cost_units,
        }
    }
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The action-type key this tool serves.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Cheap structural check run before `execute`.
    ///
    /// The default requires every key listed under the schema's `required`
    /// array to be present and non-null.
    fn validate(&self, params: &Map<String, Value>) -> bool {
        let schema = self.parameters_schema();
        schema["required"]
            .as_array()
            .map(|required| {
                required
                    .iter()
                    .filter_map(|k| k.as_str())
                    .all(|k| params.get(k).map_or(false, |v| !v.is_null()))
            })
            .unwrap_or(true)
    }

    /// Execute the tool. An `Err` is a tool-reported failure and is recorded,
    /// never retried here.
    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("A tool is already registered for action '{0}'")]
    DuplicateKey(String),
}

/// Collaborators the built-in tools need. A tool whose collaborator is
/// missing is simply not registered.
#[derive(Clone)]
pub struct BuiltinTools {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub model: String,
    pub tokens_per_cost_unit: u64,
    pub issue_tracker: Option<IssueTracker>,
    pub locator_registry: PathBuf,
    pub approvals: Arc<dyn ApprovalStore>,
}

/// Registry of available tools, keyed by action type.
///
/// # Invariants
/// - Exactly one tool per key
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in tool whose collaborator is configured.
    pub fn with_builtins(builtins: BuiltinTools) -> Result<Self, RegistryError> {
        let mut registry = Self::empty();

        registry.register(Arc::new(ReadFile))?;
        registry.register(Arc::new(WriteFile))?;
        registry.register(Arc::new(RunTests))?;
        registry.register(Arc::new(GitCreateBranch))?;
        registry.register(Arc::new(GitCommit))?;
        registry.register(Arc::new(LookupLocator::new(builtins.locator_registry)))?;
        registry.register(Arc::new(RequestApproval::new(builtins.approvals)))?;

        match builtins.issue_tracker {
            Some(tracker) => registry.register(Arc::new(FetchStory::new(tracker)))?,
            None => tracing::info!("No issue tracker configured; {} disabled", keys::FETCH_STORY),
        }
        match builtins.llm {
            Some(llm) => registry.register(Arc::new(CallAi::new(
                llm,
                builtins.model,
                builtins.tokens_per_cost_unit,
            )))?,
            None => tracing::info!("No AI provider configured; {} disabled", keys::CALL_AI),
        }

        tracing::info!("Tool registry ready with {} tools", registry.tools.len());
        Ok(registry)
    }

    /// Register a tool under its own name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let key = tool.name().to_string();
        if self.tools.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        self.tools.insert(key, tool);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(key).cloned()
    }

    pub fn has_tool(&self, key: &str) -> bool {
        self.tools.contains_key(key)
    }

    /// List all available tools, sorted by key.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// Run one tool call under a timeout and turn every way it can end into a
/// recordable outcome. Emits one structured audit line per call.
///
/// # Postconditions
/// - Never panics or propagates; validation failures, tool errors and
///   timeouts all become `success == false`
/// - Failed calls carry zero cost
pub async fn invoke(
    tool: &dyn Tool,
    params: &Map<String, Value>,
    ctx: &ToolContext,
    timeout: Duration,
) -> (ToolOutcome, u64) {
    let start = Instant::now();

    let (outcome, label) = if !tool.validate(params) {
        (
            ToolOutcome::failure(format!("Invalid parameters for {}", tool.name())),
            "invalid",
        )
    } else {
        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(Ok(out)) => (ToolOutcome::from(out), "ok"),
            Ok(Err(e)) => (ToolOutcome::failure(e.to_string()), "error"),
            Err(_) => (
                ToolOutcome::failure(format!(
                    "{} timed out after {}s",
                    tool.name(),
                    timeout.as_secs()
                )),
                "timeout",
            ),
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let audit = serde_json::json!({
        "event": "tool_audit",
        "execution_id": ctx.execution_id.to_string(),
        "iteration": ctx.iteration,
        "tool": tool.name(),
        "ok": outcome.success,
        "outcome": label,
        "duration_ms": duration_ms,
        "cost_units": outcome.cost_units,
    });
    if outcome.success {
        tracing::info!(audit = %audit, "tool");
    } else {
        tracing::warn!(audit = %audit, error = ?outcome.error_message, "tool");
    }

    (outcome, duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "SLEEPY"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"]
            })
        }

        async fn execute(
            &self,
            params: &Map<String, Value>,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            let ms = params["ms"].as_u64().unwrap_or(0);
            if ms == 0 {
                anyhow::bail!("nothing to do");
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutput::from_json(json!({ "slept": ms })).with_cost(2))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            execution_id: Uuid::new_v4(),
            iteration: 0,
            working_dir: std::env::temp_dir(),
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Sleepy)).unwrap();
        assert_eq!(
            registry.register(Arc::new(Sleepy)),
            Err(RegistryError::DuplicateKey("SLEEPY".to_string()))
        );
        assert!(registry.has_tool("SLEEPY"));
        assert!(registry.get(keys::CALL_AI).is_none());
        assert_eq!(registry.list_tools().len(), 1);
    }

    #[test]
    fn test_default_validate_checks_required() {
        assert!(Sleepy.validate(&params(json!({ "ms": 1 }))));
        assert!(!Sleepy.validate(&params(json!({}))));
        assert!(!Sleepy.validate(&params(json!({ "ms": null }))));
    }

    #[tokio::test]
    async fn test_invoke_success_carries_cost() {
        let (outcome, _) = invoke(&Sleepy, &params(json!({ "ms": 1 })), &ctx(), Duration::from_secs(5)).await;
        assert!(outcome.success);
        assert_eq!(outcome.cost_units, 2);
        assert_eq!(outcome.output["slept"], json!(1));
    }

    #[tokio::test]
    async fn test_invoke_maps_errors_and_timeouts_to_failures() {
        let (outcome, _) = invoke(&Sleepy, &params(json!({ "ms": 0 })), &ctx(), Duration::from_secs(5)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_message.as_deref(), Some("nothing to do"));

        let (outcome, _) = invoke(&Sleepy, &params(json!({ "ms": 500 })), &ctx(), Duration::from_millis(10)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.cost_units, 0);
        assert!(outcome.error_message.unwrap().contains("timed out"));

        let (outcome, _) = invoke(&Sleepy, &params(json!({})), &ctx(), Duration::from_secs(5)).await;
        assert!(outcome.error_message.unwrap().starts_with("Invalid parameters"));
    }

    #[test]
    fn test_resolve_path() {
        let ws = Path::new("/work");
        assert_eq!(resolve_path("a/b.txt", ws), PathBuf::from("/work/a/b.txt"));
        assert_eq!(resolve_path("/etc/hosts", ws), PathBuf::from("/etc/hosts"));
    }
}
