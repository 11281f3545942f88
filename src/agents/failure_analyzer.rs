//! Failure analyzer: classifies why a test failed.
//!
//! (READ_FILE when `test_path` is given) → CALL_AI → Done with the
//! classification as result.

use serde_json::json;

use super::policy;
use super::Plan;
use crate::execution::{ActionHistory, Goal};
use crate::tools::keys;

const CATEGORIES: &str =
    "LOCATOR_CHANGED, TIMING_ISSUE, TEST_DATA, ENVIRONMENT, PRODUCT_BUG, UNKNOWN";

pub fn plan(goal: &Goal, history: &ActionHistory) -> Plan {
    if let Some(verdict) = policy::after_failure(goal, history) {
        return verdict;
    }

    let (Some(test_name), Some(error_message)) =
        (goal.param_str("test_name"), goal.param_str("error_message"))
    else {
        return Plan::abort("Failure analysis needs 'test_name' and 'error_message'");
    };

    let source = match goal.param_str("test_path") {
        Some(path) => match policy::output_of(history, keys::READ_FILE, "content") {
            Some(content) => Some(content),
            None => return Plan::next(keys::READ_FILE, json!({ "path": path })),
        },
        None => None,
    };

    let Some(answer) = policy::output_of(history, keys::CALL_AI, "content") else {
        let mut prompt = format!(
            "Classify the failure of test '{name}' into exactly one of: {categories}.\n\
             Answer with the category on the first line, then a short explanation \
             and a suggested fix.\n\nError:\n{error}\n",
            name = test_name,
            categories = CATEGORIES,
            error = policy::excerpt(error_message),
        );
        if let Some(source) = source {
            prompt.push_str("\nTest source:\n");
            prompt.push_str(&policy::excerpt(source));
        }
        return Plan::next(
            keys::CALL_AI,
            json!({ "prompt": prompt, "purpose": "classify_failure" }),
        );
    };

    Plan::done(answer.trim().to_string())
}
