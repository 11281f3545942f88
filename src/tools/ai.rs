//! AI call tool: one chat completion, metered by tokens.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{keys, str_param, Tool, ToolContext, ToolOutput};
use crate::llm::{ChatMessage, ChatOptions, LlmClient};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a senior QA automation engineer. Answer with the requested artifact only.";

pub struct CallAi {
    llm: Arc<dyn LlmClient>,
    model: String,
    tokens_per_cost_unit: u64,
}

impl CallAi {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, tokens_per_cost_unit: u64) -> Self {
        Self {
            llm,
            model,
            tokens_per_cost_unit: tokens_per_cost_unit.max(1),
        }
    }

    /// Cost units for a completion: tokens rounded up, and at least one unit
    /// so every AI call is metered.
    pub fn cost_for_tokens(&self, total_tokens: u64) -> u64 {
        total_tokens.div_ceil(self.tokens_per_cost_unit).max(1)
    }
}

#[async_trait]
impl Tool for CallAi {
    fn name(&self) -> &str {
        keys::CALL_AI
    }

    fn description(&self) -> &str {
        "Send a prompt to the configured language model and return its answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "User prompt" },
                "system": { "type": "string", "description": "Optional: system prompt override" },
                "purpose": { "type": "string", "description": "Optional: label for audit (e.g. 'classify_failure')" }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let prompt = str_param(params, "prompt")?;
        let system = params
            .get("system")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: None,
        };
        let response = self
            .llm
            .chat_completion(&self.model, &messages, options)
            .await?;

        let content = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Model returned an empty answer"))?;
        let usage = response.usage;
        let total_tokens = usage.map(|u| u.total_tokens).unwrap_or(0);

        Ok(ToolOutput::from_json(json!({
            "content": content,
            "model": response.model.unwrap_or_else(|| self.model.clone()),
            "prompt_tokens": usage.map(|u| u.prompt_tokens).unwrap_or(0),
            "completion_tokens": usage.map(|u| u.completion_tokens).unwrap_or(0),
        }))
        .with_cost(self.cost_for_tokens(total_tokens)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, TokenUsage};
    use uuid::Uuid;

    struct CannedLlm(Option<String>);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn chat_completion(
            &self,
            model: &str,
            messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            assert_eq!(messages.len(), 2);
            Ok(ChatResponse {
                content: self.0.clone(),
                finish_reason: Some("stop".to_string()),
                usage: Some(TokenUsage::new(1500, 600)),
                model: Some(model.to_string()),
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            execution_id: Uuid::new_v4(),
            iteration: 1,
            working_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_cost_rounds_up_and_is_never_zero() {
        let tool = CallAi::new(Arc::new(CannedLlm(None)), "m".to_string(), 1000);
        assert_eq!(tool.cost_for_tokens(0), 1);
        assert_eq!(tool.cost_for_tokens(1000), 1);
        assert_eq!(tool.cost_for_tokens(1001), 2);
        assert_eq!(tool.cost_for_tokens(2100), 3);
    }

    #[tokio::test]
    async fn test_completion_is_metered() {
        let tool = CallAi::new(
            Arc::new(CannedLlm(Some("TIMING_ISSUE".to_string()))),
            "openai/gpt-4o-mini".to_string(),
            1000,
        );
        let mut params = Map::new();
        params.insert("prompt".to_string(), json!("classify"));
        let out = tool.execute(&params, &ctx()).await.unwrap();
        assert_eq!(out.output["content"], json!("TIMING_ISSUE"));
        assert_eq!(out.output["prompt_tokens"], json!(1500));
        assert_eq!(out.cost_units, 3);
    }

    #[tokio::test]
    async fn test_empty_answer_fails() {
        let tool = CallAi::new(Arc::new(CannedLlm(Some("  ".to_string()))), "m".to_string(), 1000);
        let mut params = Map::new();
        params.insert("prompt".to_string(), json!("x"));
        assert!(tool.execute(&params, &ctx()).await.is_err());
    }
}
