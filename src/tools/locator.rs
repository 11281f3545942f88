//! Locator registry lookup used by the self-healing fixer.
//!
//! The registry is a JSON object mapping a broken locator to its current
//! replacement, either at the top level or under a `"locators"` key:
//!
//! ```json
//! { "locators": { "#login-btn": "[data-test=login]" } }
//! ```
//!
//! A missing registry file is treated as an empty registry.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{keys, str_param, Tool, ToolContext, ToolOutput};

pub struct LookupLocator {
    registry_path: PathBuf,
}

impl LookupLocator {
    pub fn new(registry_path: PathBuf) -> Self {
        Self { registry_path }
    }

    async fn load(&self) -> anyhow::Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.registry_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        let mut root: Value = serde_json::from_str(&raw).map_err(|e| {
            anyhow::anyhow!(
                "Invalid locator registry {}: {}",
                self.registry_path.display(),
                e
            )
        })?;
        let table = if root.get("locators").is_some() {
            root["locators"].take()
        } else {
            root
        };
        match table {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("Locator registry must be a JSON object"),
        }
    }
}

#[async_trait]
impl Tool for LookupLocator {
    fn name(&self) -> &str {
        keys::LOOKUP_LOCATOR
    }

    fn description(&self) -> &str {
        "Look up the current replacement for a broken element locator."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "locator": {
                    "type": "string",
                    "description": "The locator that no longer matches, e.g. '#login-btn'"
                }
            },
            "required": ["locator"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let locator = str_param(params, "locator")?;
        let table = self.load().await?;

        let replacement = table
            .get(locator)
            .and_then(|v| v.as_str())
            .filter(|r| !r.trim().is_empty() && *r != locator);

        Ok(ToolOutput::from_json(json!({
            "locator": locator,
            "found": replacement.is_some(),
            "replacement": replacement,
        })))
    }
}
