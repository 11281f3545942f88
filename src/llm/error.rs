//! LLM error types with retry classification.
//!
//! Transient errors (rate limits, 5xx, network) are retried inside the
//! client; everything else surfaces to the caller as a failed tool call.

use std::time::Duration;

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Other 4xx, never retried
    ClientError,
    /// Connection failure or request timeout
    NetworkError,
    /// Response body did not match the OpenAI-compatible shape
    ParseError,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LlmErrorKind::RateLimited => "Rate limited",
            LlmErrorKind::ServerError => "Server error",
            LlmErrorKind::ClientError => "Client error",
            LlmErrorKind::NetworkError => "Network error",
            LlmErrorKind::ParseError => "Parse error",
        };
        f.write_str(label)
    }
}

/// Error from LLM API calls.
#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// From the Retry-After header, when the provider sent one
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Build an error from a non-success HTTP response.
    pub fn from_status(status_code: u16, message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message,
            retry_after,
        }
    }

    pub fn network(message: String) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    pub fn parse(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before retry attempt `attempt` (0-based).
    ///
    /// Honors Retry-After, otherwise exponential backoff from a per-kind
    /// base, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }
        let base_secs: u64 = match self.kind {
            LlmErrorKind::RateLimited => 5,
            LlmErrorKind::ServerError => 2,
            _ => 1,
        };
        let delay = base_secs.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_secs(delay.min(60))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Upper bound on the total time spent retrying one request
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
        assert!(!classify_http_status(404).is_transient());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let error = LlmError::from_status(500, "down".to_string(), None);
        assert!(error.suggested_delay(1) > error.suggested_delay(0));
        assert_eq!(error.suggested_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_respected() {
        let error = LlmError::from_status(429, "slow down".to_string(), Some(Duration::from_secs(30)));
        assert_eq!(error.suggested_delay(4), Duration::from_secs(30));
        assert!(error.to_string().contains("HTTP 429"));
    }

    #[test]
    fn test_client_errors_not_retried() {
        let config = RetryConfig::default();
        let error = LlmError::from_status(400, "bad".to_string(), None);
        assert!(!config.should_retry(&error, 0));
        let error = LlmError::network("reset".to_string());
        assert!(config.should_retry(&error, 2));
        assert!(!config.should_retry(&error, 3));
    }
}
