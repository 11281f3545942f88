//! Git tools: branch creation and commits, via the `git` CLI.
//!
//! Both operate on the workspace repository unless `repo_path` is given.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{keys, resolve_path, str_param, Tool, ToolContext, ToolOutput};

fn repo_path(params: &Map<String, Value>, ctx: &ToolContext) -> PathBuf {
    params
        .get("repo_path")
        .and_then(|v| v.as_str())
        .map(|p| resolve_path(p, &ctx.working_dir))
        .unwrap_or_else(|| ctx.working_dir.clone())
}

/// Create (or reset) a branch and switch to it.
pub struct GitCreateBranch;

#[async_trait]
impl Tool for GitCreateBranch {
    fn name(&self) -> &str {
        keys::GIT_CREATE_BRANCH
    }

    fn description(&self) -> &str {
        "Create a git branch from the current HEAD and check it out."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "branch": {
                    "type": "string",
                    "description": "Branch name, e.g. 'qa/PROJ-123'"
                },
                "repo_path": {
                    "type": "string",
                    "description": "Optional: repository path. Defaults to the workspace."
                }
            },
            "required": ["branch"]
        })
    }

    fn validate(&self, params: &Map<String, Value>) -> bool {
        params
            .get("branch")
            .and_then(|v| v.as_str())
            .map_or(false, is_valid_branch_name)
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let branch = str_param(params, "branch")?;
        let repo = repo_path(params, ctx);

        // -B so a retried action lands on the same branch instead of failing
        run_git_command(&["checkout", "-B", branch], &repo).await?;

        Ok(ToolOutput::from_json(json!({ "branch": branch })))
    }
}

/// Stage changes and create a commit.
pub struct GitCommit;

#[async_trait]
impl Tool for GitCommit {
    fn name(&self) -> &str {
        keys::GIT_COMMIT
    }

    fn description(&self) -> &str {
        "Stage changes and create a git commit with the given message."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The commit message"
                },
                "files": {
                    "type": "string",
                    "description": "Optional: comma-separated files to stage. Stages all changes when omitted."
                },
                "repo_path": {
                    "type": "string",
                    "description": "Optional: repository path. Defaults to the workspace."
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let message = str_param(params, "message")?;
        let repo = repo_path(params, ctx);

        let files: Vec<&str> = params
            .get("files")
            .and_then(|v| v.as_str())
            .map(|s| s.split(',').map(str::trim).filter(|f| !f.is_empty()).collect())
            .unwrap_or_default();

        if files.is_empty() {
            run_git_command(&["add", "-A"], &repo).await?;
        } else {
            let mut git_args = vec!["add", "--"];
            git_args.extend(files.iter().copied());
            run_git_command(&git_args, &repo).await?;
        }

        run_git_command(&["commit", "-m", message], &repo).await?;
        let commit = run_git_command(&["rev-parse", "HEAD"], &repo).await?;

        Ok(ToolOutput::from_json(json!({
            "commit": commit.trim(),
            "message": message,
        })))
    }
}

/// Reject names git would refuse or misread as options.
fn is_valid_branch_name(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
}

/// Run a git command and return its stdout.
async fn run_git_command(args: &[&str], repo_path: &Path) -> anyhow::Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run git: {}", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        if stderr.trim().is_empty() {
            anyhow::bail!("git {} failed: {}", args.join(" "), stdout.trim());
        }
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(stdout.to_string())
}
