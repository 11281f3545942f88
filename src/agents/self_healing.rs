//! Self-healing fixer: replaces a broken element locator in a test.
//!
//! READ_FILE → LOOKUP_LOCATOR → (CALL_AI when the registry has no
//! replacement) → WRITE_FILE → RUN_TESTS → Done when the tests pass.

use serde_json::json;

use super::policy::{self, DEFAULT_MAX_RETRIES};
use super::Plan;
use crate::execution::{ActionHistory, Goal};
use crate::tools::keys;

/// First usable line of a model answer, without quotes or fences.
fn clean_locator(answer: &str) -> String {
    policy::strip_code_fences(answer)
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '`' || c == '"' || c == '\''))
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

pub fn plan(goal: &Goal, history: &ActionHistory) -> Plan {
    if let Some(verdict) = policy::after_failure(goal, history) {
        return verdict;
    }

    let (Some(test_path), Some(locator)) = (goal.param_str("test_path"), goal.param_str("locator"))
    else {
        return Plan::abort("Self-healing needs 'test_path' and 'locator'");
    };
    let error_message = goal.param_str("error_message").unwrap_or("locator not found");
    let test_command = goal
        .param_str("test_command")
        .map(str::to_string)
        .unwrap_or_else(|| format!("npx playwright test {}", test_path));

    let Some(source) = policy::output_of(history, keys::READ_FILE, "content") else {
        return Plan::next(keys::READ_FILE, json!({ "path": test_path }));
    };

    let Some(lookup) = history.last_success(keys::LOOKUP_LOCATOR) else {
        return Plan::next(keys::LOOKUP_LOCATOR, json!({ "locator": locator }));
    };

    let replacement = match lookup.output_str("replacement") {
        Some(found) if lookup.output_bool("found") == Some(true) => found.to_string(),
        _ => match policy::output_of(history, keys::CALL_AI, "content") {
            Some(answer) => clean_locator(answer),
            None => {
                let prompt = format!(
                    "The locator `{locator}` in {path} no longer matches.\n\
                     Failure: {error}\n\nTest source:\n{source}\n\n\
                     Reply with the replacement locator only, on a single line.",
                    locator = locator,
                    path = test_path,
                    error = error_message,
                    source = policy::excerpt(source),
                );
                return Plan::next(
                    keys::CALL_AI,
                    json!({ "prompt": prompt, "purpose": "discover_locator" }),
                );
            }
        },
    };

    if replacement.is_empty() || replacement == locator {
        return Plan::abort(format!("No replacement found for locator '{}'", locator));
    }
    if !source.contains(locator) {
        return Plan::abort(format!("Locator '{}' does not appear in {}", locator, test_path));
    }

    if history.last_success(keys::WRITE_FILE).is_none() {
        return Plan::next(
            keys::WRITE_FILE,
            json!({ "path": test_path, "content": source.replace(locator, &replacement) }),
        );
    }

    let Some(last_run) = history.last_success(keys::RUN_TESTS) else {
        return Plan::next(keys::RUN_TESTS, json!({ "command": test_command }));
    };
    if last_run.output_bool("passed") == Some(true) {
        return Plan::done(format!(
            "Healed locator '{}' -> '{}' in {}",
            locator, replacement, test_path
        ));
    }

    let failing_runs = history
        .successes(keys::RUN_TESTS)
        .filter(|r| r.output_bool("passed") != Some(true))
        .count() as u64;
    let max_retries = goal.param_u64("max_retries").unwrap_or(DEFAULT_MAX_RETRIES);
    if failing_runs <= max_retries {
        return Plan::next(
            keys::RUN_TESTS,
            json!({ "command": test_command, "attempt": failing_runs + 1 }),
        );
    }

    Plan::abort(format!(
        "Tests still failing after replacing '{}' with '{}' ({} runs)",
        locator, replacement, failing_runs
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::policy::test_support::HistoryBuilder;

    fn goal() -> Goal {
        Goal::new("heal_test")
            .with_param("test_path", "tests/login.spec.ts")
            .with_param("locator", "#login")
            .with_param("error_message", "waiting for #login")
            .with_param("test_command", "npm test")
    }

    fn read_and_lookup(found: Option<&str>) -> HistoryBuilder {
        HistoryBuilder::new()
            .ok(
                keys::READ_FILE,
                json!({"path": "tests/login.spec.ts"}),
                json!({"content": "await page.click('#login');"}),
            )
            .ok(
                keys::LOOKUP_LOCATOR,
                json!({"locator": "#login"}),
                json!({"found": found.is_some(), "replacement": found}),
            )
    }

    #[test]
    fn test_registry_hit_skips_ai() {
        let history = read_and_lookup(Some("[data-test=login]")).build();
        match plan(&goal(), &history) {
            Plan::Next(next) => {
                assert_eq!(next.action_type, keys::WRITE_FILE);
                assert_eq!(
                    next.parameters["content"],
                    json!("await page.click('[data-test=login]');")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_registry_miss_asks_ai() {
        let history = read_and_lookup(None).build_ref();
        assert_eq!(plan(&goal(), &history).action_type(), Some(keys::CALL_AI));

        let history = read_and_lookup(None)
            .ok(keys::CALL_AI, json!({}), json!({"content": "`button#sign-in`\n"}))
            .build();
        match plan(&goal(), &history) {
            Plan::Next(next) => assert_eq!(
                next.parameters["content"],
                json!("await page.click('button#sign-in');")
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rerun_then_done_or_abort() {
        let written = read_and_lookup(Some("#sign-in")).ok(keys::WRITE_FILE, json!({}), json!({}));
        assert_eq!(
            plan(&goal(), &written.build_ref()).action_type(),
            Some(keys::RUN_TESTS)
        );

        let passed = written
            .ok(keys::RUN_TESTS, json!({}), json!({"passed": false}))
            .ok(keys::RUN_TESTS, json!({}), json!({"passed": true}));
        assert!(matches!(plan(&goal(), &passed.build()), Plan::Done { .. }));

        let failing = read_and_lookup(Some("#sign-in"))
            .ok(keys::WRITE_FILE, json!({}), json!({}))
            .ok(keys::RUN_TESTS, json!({}), json!({"passed": false}))
            .ok(keys::RUN_TESTS, json!({}), json!({"passed": false}))
            .ok(keys::RUN_TESTS, json!({}), json!({"passed": false}))
            .build();
        assert!(matches!(plan(&goal(), &failing), Plan::Abort { .. }));
    }

    #[test]
    fn test_useless_replacement_aborts() {
        let history = read_and_lookup(None)
            .ok(keys::CALL_AI, json!({}), json!({"content": "#login"}))
            .build();
        assert!(matches!(plan(&goal(), &history), Plan::Abort { .. }));
        assert_eq!(clean_locator("```\n\"#a\"\n```"), "#a");
        assert_eq!(clean_locator(""), "");
    }
}
