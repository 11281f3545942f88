//! Quality monitor: runs the suite and writes a summarized report.
//!
//! RUN_TESTS → CALL_AI → WRITE_FILE(report_path) → Done

use serde_json::json;

use super::policy;
use super::Plan;
use crate::execution::{ActionHistory, Goal};
use crate::tools::keys;

pub fn plan(goal: &Goal, history: &ActionHistory) -> Plan {
    if let Some(verdict) = policy::after_failure(goal, history) {
        return verdict;
    }

    let (Some(test_command), Some(report_path)) =
        (goal.param_str("test_command"), goal.param_str("report_path"))
    else {
        return Plan::abort("Quality monitoring needs 'test_command' and 'report_path'");
    };

    let Some(run) = history.last_success(keys::RUN_TESTS) else {
        return Plan::next(keys::RUN_TESTS, json!({ "command": test_command }));
    };
    let passed = run.output_bool("passed") == Some(true);

    let Some(summary) = policy::output_of(history, keys::CALL_AI, "content") else {
        let prompt = format!(
            "Summarize this test run as a Markdown quality report: totals, \
             failing tests, likely causes, and recommended follow-ups.\n\n\
             Command: {command}\nExit code: {exit}\n\nstdout:\n{stdout}\n\nstderr:\n{stderr}",
            command = test_command,
            exit = run.output.get("exit_code").cloned().unwrap_or_default(),
            stdout = policy::excerpt(run.output_str("stdout").unwrap_or_default()),
            stderr = policy::excerpt(run.output_str("stderr").unwrap_or_default()),
        );
        return Plan::next(
            keys::CALL_AI,
            json!({ "prompt": prompt, "purpose": "summarize_run" }),
        );
    };

    if history.last_success(keys::WRITE_FILE).is_none() {
        return Plan::next(
            keys::WRITE_FILE,
            json!({ "path": report_path, "content": summary.trim() }),
        );
    }

    Plan::done(format!(
        "Quality report written to {} (suite {})",
        report_path,
        if passed { "passing" } else { "failing" }
    ))
}
