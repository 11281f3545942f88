//! Behavior shared by every planner: the failure policy, the approval
//! checkpoint reading, and prompt helpers.

use serde_json::Value;

use super::Plan;
use crate::execution::{ActionHistory, ActionRecord, Goal};
use crate::tools::keys;

/// Retries allowed per failing action when the goal does not say.
pub const DEFAULT_MAX_RETRIES: u64 = 2;

/// Characters of file content or tool output quoted into a prompt.
const PROMPT_EXCERPT_CHARS: usize = 6_000;

/// Retry-or-abort verdict when the latest record failed.
///
/// Returns `None` when the last record succeeded (or there is none), leaving
/// the variant to plan normally.
///
/// # Postconditions
/// - A retry reuses the failed action's type and input verbatim
/// - After `max_retries` consecutive failures of the same action the plan
///   is `Abort`
/// - A rejected approval always aborts
pub fn after_failure(goal: &Goal, history: &ActionHistory) -> Option<Plan> {
    let last = history.last().filter(|r| !r.success)?;

    if last.action_type == keys::APPROVAL_DECISION {
        return Some(Plan::abort(rejection_reason(last)));
    }

    let max_retries = goal.param_u64("max_retries").unwrap_or(DEFAULT_MAX_RETRIES);
    let failures = history.trailing_failures() as u64;
    if failures <= max_retries {
        return Some(Plan::next(
            &last.action_type,
            Value::Object(last.input.clone()),
        ));
    }

    Some(Plan::abort(format!(
        "{} failed {} times in a row: {}",
        last.action_type,
        failures,
        last.error_message.as_deref().unwrap_or("no error message")
    )))
}

/// Human-readable reason recorded when an approval is rejected.
pub fn rejection_reason(decision: &ActionRecord) -> String {
    let reviewer = decision.output_str("reviewer").unwrap_or("reviewer");
    match decision.output_str("notes").filter(|n| !n.trim().is_empty()) {
        Some(notes) => format!("Rejected by {}: {}", reviewer, notes),
        None => format!("Rejected by {}", reviewer),
    }
}

/// Where the execution stands with respect to its approval checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    NotRequested,
    /// Ticket opened but no decision recorded yet
    Pending,
    Approved,
    Rejected,
}

/// Read the checkpoint from the most recent successful approval request and
/// any decision recorded after it.
pub fn checkpoint(history: &ActionHistory) -> Checkpoint {
    let Some(request) = history.last_success(keys::REQUEST_APPROVAL) else {
        return Checkpoint::NotRequested;
    };
    match history
        .records()
        .iter()
        .rev()
        .take_while(|r| r.iteration > request.iteration)
        .find(|r| r.action_type == keys::APPROVAL_DECISION)
    {
        None => Checkpoint::Pending,
        Some(decision) if decision.success => Checkpoint::Approved,
        Some(_) => Checkpoint::Rejected,
    }
}

/// Output string of the latest successful record of `action_type`.
pub fn output_of<'a>(history: &'a ActionHistory, action_type: &str, key: &str) -> Option<&'a str> {
    history
        .last_success(action_type)
        .and_then(|r| r.output_str(key))
}

/// Char-safe excerpt for prompts; keeps the head.
pub fn excerpt(text: &str) -> String {
    if text.chars().count() <= PROMPT_EXCERPT_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PROMPT_EXCERPT_CHARS).collect();
    format!("{}\n[... truncated]", head)
}

/// Remove a surrounding Markdown code fence from a model answer.
pub fn strip_code_fences(answer: &str) -> String {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (```ts) on the opening line
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim_end()
        .to_string()
}


#[cfg(test)]
mod tests {
    use super::test_support::HistoryBuilder;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_then_abort() {
        let goal = Goal::new("x");
        let once = HistoryBuilder::new()
            .fail(keys::READ_FILE, json!({"path": "a.ts"}))
            .build();
        assert_eq!(
            after_failure(&goal, &once),
            Some(Plan::next(keys::READ_FILE, json!({"path": "a.ts"})))
        );

        let thrice = HistoryBuilder::new()
            .fail(keys::READ_FILE, json!({"path": "a.ts"}))
            .fail(keys::READ_FILE, json!({"path": "a.ts"}))
            .fail(keys::READ_FILE, json!({"path": "a.ts"}))
            .build();
        assert!(matches!(after_failure(&goal, &thrice), Some(Plan::Abort { .. })));

        let strict = Goal::new("x").with_param("max_retries", 0);
        assert!(matches!(after_failure(&strict, &once), Some(Plan::Abort { .. })));
    }

    #[test]
    fn test_no_verdict_after_success() {
        let history = HistoryBuilder::new()
            .fail(keys::READ_FILE, json!({}))
            .ok(keys::READ_FILE, json!({}), json!({"content": "x"}))
            .build();
        assert_eq!(after_failure(&Goal::new("x"), &history), None);
        assert_eq!(after_failure(&Goal::new("x"), &ActionHistory::new()), None);
    }

    #[test]
    fn test_checkpoint_reading() {
        let requested = HistoryBuilder::new().ok(
            keys::REQUEST_APPROVAL,
            json!({"content": "c"}),
            json!({"ticket_id": "apr-1"}),
        );
        assert_eq!(checkpoint(&ActionHistory::new()), Checkpoint::NotRequested);

        let approved = HistoryBuilder::new()
            .ok(keys::REQUEST_APPROVAL, json!({"content": "c"}), json!({"ticket_id": "apr-1"}))
            .ok(keys::APPROVAL_DECISION, json!({}), json!({"approved": true}))
            .build();
        assert_eq!(checkpoint(&approved), Checkpoint::Approved);

        let rejected = requested
            .fail(keys::APPROVAL_DECISION, json!({}))
            .build();
        assert_eq!(checkpoint(&rejected), Checkpoint::Rejected);
        assert!(matches!(
            after_failure(&Goal::new("x"), &rejected),
            Some(Plan::Abort { .. })
        ));

        let pending = HistoryBuilder::new()
            .ok(keys::REQUEST_APPROVAL, json!({"content": "c"}), json!({"ticket_id": "apr-2"}))
            .build();
        assert_eq!(checkpoint(&pending), Checkpoint::Pending);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```ts\ntest('a');\n```\n"), "test('a');");
        assert_eq!(strip_code_fences("  plain  "), "plain");
        assert_eq!(strip_code_fences("```\nno close"), "no close");
    }

    #[test]
    fn test_excerpt_is_char_safe() {
        let long = "é".repeat(PROMPT_EXCERPT_CHARS + 5);
        let cut = excerpt(&long);
        assert!(cut.ends_with("[... truncated]"));
        assert_eq!(excerpt("short"), "short");
    }
}
