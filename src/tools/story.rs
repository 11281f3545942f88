//! Issue-tracker fetch: loads the user story a test is generated from.
//!
//! The tracker URL may contain a `{key}` placeholder
//! (`https://jira.example.com/rest/api/2/issue/{key}`); otherwise the
//! url-encoded key is appended as a path segment.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{keys, str_param, Tool, ToolContext, ToolOutput};

/// Where stories live and how to authenticate.
#[derive(Debug, Clone)]
pub struct IssueTracker {
    pub base_url: String,
    pub token: Option<String>,
}

impl IssueTracker {
    pub fn story_url(&self, story_key: &str) -> String {
        let encoded = urlencoding::encode(story_key);
        if self.base_url.contains("{key}") {
            self.base_url.replace("{key}", &encoded)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), encoded)
        }
    }
}

pub struct FetchStory {
    client: reqwest::Client,
    tracker: IssueTracker,
}

impl FetchStory {
    pub fn new(tracker: IssueTracker) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, tracker }
    }
}

/// First string found at any of the given JSON pointers.
fn first_str<'a>(body: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| body.pointer(p).and_then(|v| v.as_str()))
}

/// Flatten a tracker payload into the fields planners use.
fn story_fields(story_key: &str, body: &Value) -> Value {
    json!({
        "story_key": story_key,
        "summary": first_str(body, &["/fields/summary", "/summary", "/title"]).unwrap_or_default(),
        "description": first_str(body, &["/fields/description", "/description", "/body"])
            .unwrap_or_default(),
        "acceptance_criteria": first_str(
            body,
            &["/fields/acceptance_criteria", "/acceptance_criteria", "/acceptanceCriteria"],
        )
        .unwrap_or_default(),
    })
}

#[async_trait]
impl Tool for FetchStory {
    fn name(&self) -> &str {
        keys::FETCH_STORY
    }

    fn description(&self) -> &str {
        "Fetch a user story (summary, description, acceptance criteria) from the issue tracker."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "story_key": {
                    "type": "string",
                    "description": "Issue key, e.g. 'PROJ-123'"
                }
            },
            "required": ["story_key"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let story_key = str_param(params, "story_key")?;
        let url = self.tracker.story_url(story_key);

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = &self.tracker.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Issue tracker request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Issue tracker returned HTTP {} for {}", status.as_u16(), story_key);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Issue tracker returned invalid JSON: {}", e))?;

        Ok(ToolOutput::from_json(story_fields(story_key, &body)))
    }
}
