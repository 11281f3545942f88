//! OpenRouter-compatible chat-completion client with automatic retry for
//! transient errors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::{LlmError, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    endpoint: String,
    retry_config: RetryConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: OPENROUTER_API_URL.to_string(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Point the client at another OpenAI-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &CompletionRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "qapilot")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {}", e))
                } else {
                    LlmError::network(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, retry_after));
        }

        parse_completion(&body, &request.model)
    }

    async fn execute_with_retry(&self, request: &CompletionRequest) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Completion succeeded after {} retries ({:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !self.retry_config.should_retry(&error, attempt) {
                tracing::error!("Completion failed after {} retries: {}", attempt, error);
                return Err(error.into());
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let delay = error.suggested_delay(attempt).min(remaining);
            if delay.is_zero() {
                tracing::warn!("Retry window exhausted: {}", error);
                return Err(error.into());
            }

            tracing::warn!(
                "Completion attempt {} failed ({}), retrying in {:?}",
                attempt + 1,
                error.kind,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn parse_completion(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::parse(format!("Failed to parse response: {}", e)))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse("No choices in response".to_string()))?;

    Ok(ChatResponse {
        content: choice.message.content,
        finish_reason: choice.finish_reason,
        usage: parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        model: parsed.model.or_else(|| Some(requested_model.to_string())),
    })
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        tracing::debug!("Sending completion request: model={}", model);
        self.execute_with_retry(&request).await
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
