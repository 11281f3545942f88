//! File tools: read and write test sources and reports.
//!
//! - `tests/login.spec.ts` → `{workspace}/tests/login.spec.ts`
//! - `/abs/path` → used as-is

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{keys, resolve_path, str_param, Tool, ToolContext, ToolOutput};

/// Read a UTF-8 file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        keys::READ_FILE
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Binary files are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let path = str_param(params, "path")?;
        let resolved = resolve_path(path, &ctx.working_dir);

        if !resolved.exists() {
            anyhow::bail!("File not found: {} (resolved to: {})", path, resolved.display());
        }

        let bytes = tokio::fs::read(&resolved).await?;
        let size = bytes.len();
        let content = String::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("Binary file detected: {} ({} bytes)", path, size))?;

        Ok(ToolOutput::from_json(json!({
            "path": path,
            "content": content,
            "bytes": size,
        })))
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        keys::WRITE_FILE
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let path = str_param(params, "path")?;
        let content = str_param(params, "content")?;
        let resolved = resolve_path(path, &ctx.working_dir);

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content).await?;

        // Read back so a short write surfaces as a failed action
        let written = tokio::fs::metadata(&resolved).await?.len() as usize;
        if written != content.len() {
            anyhow::bail!(
                "Write verification failed: expected {} bytes, got {}",
                content.len(),
                written
            );
        }

        Ok(ToolOutput::from_json(json!({
            "path": path,
            "bytes_written": written,
        })))
    }
}
