//! Configuration management for qapilot.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `WORKSPACE_PATH` - Optional. Repository the agents work in. Defaults to current directory.
//! - `DATA_DIR` - Optional. Where executions are stored. Defaults to `<workspace>/.qapilot`.
//! - `EXECUTION_STORE` - Optional. `sqlite` or `memory`. Defaults to `sqlite`.
//! - `MAX_ITERATIONS` - Optional. Default iteration ceiling per execution. Defaults to `20`.
//! - `MAX_COST_UNITS` - Optional. Default cost ceiling per execution. Defaults to `500`.
//! - `APPROVAL_TIMEOUT_SECS` - Optional. Default approval timeout. Defaults to `86400`.
//! - `TOOL_TIMEOUT_SECS` - Optional. Upper bound on one tool call. Defaults to `300`.
//! - `OPENROUTER_API_KEY` - Optional. Enables the `CALL_AI` tool.
//! - `DEFAULT_MODEL` - Optional. Model used by `CALL_AI`. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `AI_TOKENS_PER_COST_UNIT` - Optional. Tokens billed as one cost unit. Defaults to `1000`.
//! - `ISSUE_TRACKER_URL` - Optional. Enables the `FETCH_STORY` tool.
//! - `ISSUE_TRACKER_TOKEN` - Optional. Bearer token for the issue tracker.
//! - `LOCATOR_REGISTRY_PATH` - Optional. Defaults to `<data_dir>/locators.json`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::execution::ExecutionConfig;
use crate::orchestrator::OrchestratorSettings;
use crate::store::StoreType;
use crate::tools::IssueTracker;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Repository the agents read, write and commit in
    pub workspace_path: PathBuf,

    /// Execution database and locator registry live here
    pub data_dir: PathBuf,

    pub execution_store: StoreType,

    /// Budget applied when a start request carries none
    pub default_execution: ExecutionConfig,

    pub tool_timeout_secs: u64,

    /// OpenRouter API key; `CALL_AI` is disabled without it
    pub api_key: Option<String>,

    /// Default LLM model identifier (OpenRouter format)
    pub default_model: String,

    pub tokens_per_cost_unit: u64,

    /// Issue tracker; `FETCH_STORY` is disabled without it
    pub issue_tracker: Option<IssueTracker>,

    pub locator_registry_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse
    /// or `EXECUTION_STORE` names an unknown backend.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let workspace_path = var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let data_dir = var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_path.join(".qapilot"));

        let execution_store = match var("EXECUTION_STORE") {
            None => StoreType::default(),
            Some(value) => match value.trim().to_lowercase().as_str() {
                "sqlite" | "memory" => StoreType::from_str(&value),
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "EXECUTION_STORE".to_string(),
                        format!("'{}' (expected sqlite or memory)", value),
                    ))
                }
            },
        };

        let defaults = ExecutionConfig::default();
        let default_execution = ExecutionConfig {
            max_iterations: parse_var(&var, "MAX_ITERATIONS", defaults.max_iterations)?,
            max_cost_units: parse_var(&var, "MAX_COST_UNITS", defaults.max_cost_units)?,
            approval_timeout_secs: parse_var(
                &var,
                "APPROVAL_TIMEOUT_SECS",
                defaults.approval_timeout_secs,
            )?,
        };

        let tokens_per_cost_unit: u64 = parse_var(&var, "AI_TOKENS_PER_COST_UNIT", 1000)?;
        if tokens_per_cost_unit == 0 {
            return Err(ConfigError::InvalidValue(
                "AI_TOKENS_PER_COST_UNIT".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let issue_tracker = var("ISSUE_TRACKER_URL").map(|base_url| IssueTracker {
            base_url,
            token: var("ISSUE_TRACKER_TOKEN"),
        });

        let locator_registry_path = var("LOCATOR_REGISTRY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("locators.json"));

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_var(&var, "PORT", 3000)?,
            workspace_path,
            data_dir,
            execution_store,
            default_execution,
            tool_timeout_secs: parse_var(&var, "TOOL_TIMEOUT_SECS", 300)?,
            api_key: var("OPENROUTER_API_KEY"),
            default_model: var("DEFAULT_MODEL")
                .unwrap_or_else(|| "anthropic/claude-sonnet-4.5".to_string()),
            tokens_per_cost_unit,
            issue_tracker,
            locator_registry_path,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(workspace_path: PathBuf) -> Self {
        let data_dir = workspace_path.join(".qapilot");
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            locator_registry_path: data_dir.join("locators.json"),
            workspace_path,
            data_dir,
            execution_store: StoreType::Memory,
            default_execution: ExecutionConfig::default(),
            tool_timeout_secs: 300,
            api_key: None,
            default_model: "anthropic/claude-sonnet-4.5".to_string(),
            tokens_per_cost_unit: 1000,
            issue_tracker: None,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            working_dir: self.workspace_path.clone(),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            default_config: self.default_execution,
            ..OrchestratorSettings::default()
        }
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
    }
}
