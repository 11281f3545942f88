//! Core planner types: the closed set of agent types and what a plan step
//! can be.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{failure_analyzer, flaky_test, quality_monitor, self_healing, test_generator};
use crate::execution::{ActionHistory, Goal};

/// Planner variant, chosen at `start` and fixed for the execution's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Story → AI-generated test → approval → branch + commit
    TestGenerator,
    /// Broken locator → registry or AI replacement → rewrite → rerun
    SelfHealingFixer,
    /// Repeated runs → stabilization patch → approval → commit
    FlakyTestFixer,
    /// Failure → AI classification
    FailureAnalyzer,
    /// Test run → AI summary → report file
    QualityMonitor,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::TestGenerator,
        AgentType::SelfHealingFixer,
        AgentType::FlakyTestFixer,
        AgentType::FailureAnalyzer,
        AgentType::QualityMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestGenerator => "test_generator",
            Self::SelfHealingFixer => "self_healing_fixer",
            Self::FlakyTestFixer => "flaky_test_fixer",
            Self::FailureAnalyzer => "failure_analyzer",
            Self::QualityMonitor => "quality_monitor",
        }
    }

    /// Goal type assumed when a request leaves it blank.
    pub fn default_goal_type(&self) -> &'static str {
        match self {
            Self::TestGenerator => "generate_tests",
            Self::SelfHealingFixer => "heal_test",
            Self::FlakyTestFixer => "fix_flaky_test",
            Self::FailureAnalyzer => "analyze_failure",
            Self::QualityMonitor => "monitor_quality",
        }
    }

    /// Goal parameters without which the planner cannot take a first step.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::TestGenerator => &["story_key", "output_path"],
            Self::SelfHealingFixer => &["test_path", "locator", "error_message"],
            Self::FlakyTestFixer => &["test_path", "test_command"],
            Self::FailureAnalyzer => &["test_name", "error_message"],
            Self::QualityMonitor => &["test_command", "report_path"],
        }
    }

    /// Check a goal against this agent type before an execution is created.
    pub fn check_goal(&self, goal: &Goal) -> Result<(), String> {
        goal.validate()?;
        let goal_type = goal.goal_type.trim();
        if !goal_type.is_empty()
            && goal_type != self.default_goal_type()
            && goal_type != self.as_str()
        {
            return Err(format!(
                "Goal type '{}' is not handled by agent '{}' (expected '{}')",
                goal_type,
                self,
                self.default_goal_type()
            ));
        }
        let missing: Vec<&str> = self
            .required_params()
            .iter()
            .copied()
            .filter(|p| goal.param_str(p).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "Missing goal parameter(s) for {}: {}",
                self,
                missing.join(", ")
            ));
        }
        Ok(())
    }

    /// Decide the next step.
    ///
    /// # Pure Function
    /// Identical `(goal, history)` always yields an identical plan; the run
    /// loop relies on this to replay an execution from its audit log.
    pub fn plan(&self, goal: &Goal, history: &ActionHistory) -> Plan {
        match self {
            Self::TestGenerator => test_generator::plan(goal, history),
            Self::SelfHealingFixer => self_healing::plan(goal, history),
            Self::FlakyTestFixer => flaky_test::plan(goal, history),
            Self::FailureAnalyzer => failure_analyzer::plan(goal, history),
            Self::QualityMonitor => quality_monitor::plan(goal, history),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    /// Accepts `test_generator`, `TestGenerator`, `TEST-GENERATOR`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().replace('_', "") == wanted)
            .ok_or_else(|| format!("Unknown agent type '{}'", s))
    }
}

/// An action the planner wants executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextAction {
    pub action_type: String,
    pub parameters: Map<String, Value>,
}

/// One planning verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Plan {
    Next(NextAction),
    /// Goal satisfied; `result` becomes the execution result
    Done { result: String },
    /// Goal unreachable
    Abort { reason: String },
}

impl Plan {
    /// Next action with parameters from a `json!({...})` object.
    pub fn next(action_type: &str, parameters: Value) -> Self {
        let parameters = match parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Plan::Next(NextAction {
            action_type: action_type.to_string(),
            parameters,
        })
    }

    pub fn done(result: impl Into<String>) -> Self {
        Plan::Done {
            result: result.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Plan::Abort {
            reason: reason.into(),
        }
    }

    pub fn action_type(&self) -> Option<&str> {
        match self {
            Plan::Next(action) => Some(&action.action_type),
            _ => None,
        }
    }
}
