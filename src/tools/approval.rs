//! Approval request tool: opens a ticket for a human reviewer.
//!
//! The tool only creates the ticket. Suspension of the execution is the run
//! loop's job once this action is recorded as successful.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{keys, str_param, Tool, ToolContext, ToolOutput};
use crate::approval::ApprovalStore;

pub struct RequestApproval {
    approvals: Arc<dyn ApprovalStore>,
}

impl RequestApproval {
    pub fn new(approvals: Arc<dyn ApprovalStore>) -> Self {
        Self { approvals }
    }
}

#[async_trait]
impl Tool for RequestApproval {
    fn name(&self) -> &str {
        keys::REQUEST_APPROVAL
    }

    fn description(&self) -> &str {
        "Ask a human reviewer to approve an artifact before the agent continues."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The artifact under review (test source, patch, ...)"
                },
                "summary": {
                    "type": "string",
                    "description": "Optional: one-line description for the reviewer"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let content = str_param(params, "content")?;

        let mut metadata: Map<String, Value> = params
            .iter()
            .filter(|(k, _)| k.as_str() != "content")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.insert("iteration".to_string(), json!(ctx.iteration));

        let ticket_id = self
            .approvals
            .create_ticket(ctx.execution_id, content, metadata)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create approval ticket: {}", e))?;

        tracing::info!(
            "Approval ticket {} opened for execution {}",
            ticket_id,
            ctx.execution_id
        );

        Ok(ToolOutput::from_json(json!({ "ticket_id": ticket_id })))
    }
}
