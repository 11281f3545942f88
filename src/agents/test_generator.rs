//! Test generator: turns a user story into a reviewed, committed test.
//!
//! FETCH_STORY → CALL_AI → WRITE_FILE → REQUEST_APPROVAL → GIT_CREATE_BRANCH
//! → GIT_COMMIT → Done

use serde_json::json;

use super::policy::{self, Checkpoint};
use super::Plan;
use crate::execution::{ActionHistory, Goal};
use crate::tools::keys;

pub fn plan(goal: &Goal, history: &ActionHistory) -> Plan {
    if let Some(verdict) = policy::after_failure(goal, history) {
        return verdict;
    }

    let (Some(story_key), Some(output_path)) =
        (goal.param_str("story_key"), goal.param_str("output_path"))
    else {
        return Plan::abort("Test generation needs 'story_key' and 'output_path'");
    };
    let branch = goal
        .param_str("branch")
        .map(str::to_string)
        .unwrap_or_else(|| format!("qa/{}", story_key));

    let Some(story) = history.last_success(keys::FETCH_STORY) else {
        return Plan::next(keys::FETCH_STORY, json!({ "story_key": story_key }));
    };

    let Some(generated) = policy::output_of(history, keys::CALL_AI, "content") else {
        let framework = goal.param_str("framework").unwrap_or("Playwright (TypeScript)");
        let prompt = format!(
            "Write one {framework} test file for user story {key}.\n\n\
             Summary: {summary}\n\nDescription:\n{description}\n\n\
             Acceptance criteria:\n{criteria}\n\n\
             Success criteria for this test: {success}\n\
             Cover every acceptance criterion. Reply with the file contents only.",
            framework = framework,
            key = story_key,
            summary = story.output_str("summary").unwrap_or_default(),
            description = policy::excerpt(story.output_str("description").unwrap_or_default()),
            criteria = story.output_str("acceptance_criteria").unwrap_or_default(),
            success = if goal.success_criteria.is_empty() {
                "the test passes against the acceptance criteria"
            } else {
                goal.success_criteria.as_str()
            },
        );
        return Plan::next(
            keys::CALL_AI,
            json!({ "prompt": prompt, "purpose": "generate_test" }),
        );
    };
    let test_source = policy::strip_code_fences(generated);

    if history.last_success(keys::WRITE_FILE).is_none() {
        return Plan::next(
            keys::WRITE_FILE,
            json!({ "path": output_path, "content": test_source }),
        );
    }

    match policy::checkpoint(history) {
        Checkpoint::NotRequested => {
            return Plan::next(
                keys::REQUEST_APPROVAL,
                json!({
                    "content": test_source,
                    "summary": format!("Generated test for {} at {}", story_key, output_path),
                    "path": output_path,
                }),
            );
        }
        Checkpoint::Pending => return Plan::abort("Approval requested but never decided"),
        Checkpoint::Rejected => return Plan::abort("Generated test was rejected"),
        Checkpoint::Approved => {}
    }

    if history.last_success(keys::GIT_CREATE_BRANCH).is_none() {
        return Plan::next(keys::GIT_CREATE_BRANCH, json!({ "branch": branch }));
    }

    let Some(commit) = policy::output_of(history, keys::GIT_COMMIT, "commit") else {
        return Plan::next(
            keys::GIT_COMMIT,
            json!({
                "message": format!("test: add generated test for {}", story_key),
                "files": output_path,
            }),
        );
    };

    Plan::done(format!(
        "Generated {} for {} on branch {} (commit {})",
        output_path, story_key, branch, commit
    ))
}
