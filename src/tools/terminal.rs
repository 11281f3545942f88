//! Test runner tool: executes the project's test command in the workspace.
//!
//! A run that completes is a successful action whatever the tests did; the
//! verdict is reported in `passed` / `exit_code`. Only a command that could
//! not run (blocked, spawn failure, timeout) is a failed action.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{keys, resolve_path, str_param, Tool, ToolContext, ToolOutput};

/// Output kept per stream.
const MAX_STREAM_CHARS: usize = 10_000;

/// Strip binary garbage so output stays printable in records and prompts.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect();

    // Keep the tail: test summaries are printed last
    let count = text.chars().count();
    if count > MAX_STREAM_CHARS {
        let tail: String = text.chars().skip(count - MAX_STREAM_CHARS).collect();
        format!("[... truncated]\n{}", tail)
    } else {
        text
    }
}

/// Command prefixes that are never run.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "> /dev/",
    "dd if=/dev/",
    "mkfs",
    "shutdown",
    "reboot",
];

fn validate_command(cmd: &str) -> Result<(), String> {
    let trimmed = cmd.trim();
    let unprefixed = ["sudo ", "time ", "nice ", "nohup "]
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);

    for pattern in DANGEROUS_PATTERNS {
        if trimmed.starts_with(pattern) || unprefixed.starts_with(pattern) {
            return Err(format!("Blocked dangerous command pattern '{}'", pattern));
        }
    }
    Ok(())
}

/// Run the test suite (or a single test) with a shell command.
pub struct RunTests;

#[async_trait]
impl Tool for RunTests {
    fn name(&self) -> &str {
        keys::RUN_TESTS
    }

    fn description(&self) -> &str {
        "Run a test command in the workspace and report whether it passed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command, e.g. 'npx playwright test tests/login.spec.ts'"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional: working directory. Defaults to the workspace."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 600)"
                }
            },
            "required": ["command"]
        })
    }

    fn validate(&self, params: &Map<String, Value>) -> bool {
        params
            .get("command")
            .and_then(|v| v.as_str())
            .map_or(false, |c| !c.trim().is_empty() && validate_command(c).is_ok())
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let command = str_param(params, "command")?;
        if let Err(msg) = validate_command(command) {
            tracing::warn!("Blocked dangerous command: {}", command);
            anyhow::bail!("{}", msg);
        }

        let cwd = params
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(|p| resolve_path(p, &ctx.working_dir))
            .unwrap_or_else(|| ctx.working_dir.clone());
        let timeout_secs = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(600);

        tracing::info!("Running tests in {:?}: {}", cwd, command);

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("/bin/sh", "-c")
        };

        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            Command::new(shell)
                .arg(shell_arg)
                .arg(command)
                .current_dir(&cwd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Test command timed out after {} seconds", timeout_secs))?
        .map_err(|e| anyhow::anyhow!("Failed to execute command: {}", e))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let passed = output.status.success();
        tracing::debug!("Test command finished: exit={}, passed={}", exit_code, passed);

        Ok(ToolOutput::from_json(json!({
            "command": command,
            "exit_code": exit_code,
            "passed": passed,
            "stdout": sanitize_output(&output.stdout),
            "stderr": sanitize_output(&output.stderr),
        })))
    }
}
