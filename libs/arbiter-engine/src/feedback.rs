//! Learner-facing text: the outcome's first failure message and the
//! per-test feedback report. Hidden tests only ever report pass/fail and
//! their own `order`.

use arbiter_common::{ExecutionStatus, GradingOutcome, OverallStatus, TestCase, TestReport};
use difference::{Changeset, Difference};

use crate::comparator::normalized_text;

const MAX_DETAIL_CHARS: usize = 4000;

pub const SYSTEM_ERROR_MESSAGE: &str =
    "The grader hit an internal error. This submission will be checked again.";

pub fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Accepted => "passed",
        ExecutionStatus::WrongAnswer => "wrong answer",
        ExecutionStatus::TimeLimitExceeded => "time limit exceeded",
        ExecutionStatus::MemoryLimitExceeded => "memory limit exceeded",
        ExecutionStatus::RuntimeError => "runtime error",
        ExecutionStatus::CompilationError => "compilation error",
        ExecutionStatus::SystemError => "internal error",
    }
}

/// Line diff of normalized expected vs actual output
pub fn diff(expected: &str, actual: &str) -> String {
    let Changeset { diffs, .. } = Changeset::new(&normalized_text(expected), &normalized_text(actual), "\n");

    fn prefixed(prefix: &str, chunk: &str) -> String {
        chunk
            .split('\n')
            .map(|line| format!("{}{}", prefix, line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    diffs
        .iter()
        .map(|d| match d {
            Difference::Same(chunk) => prefixed("  ", chunk),
            Difference::Rem(chunk) => prefixed("- ", chunk),
            Difference::Add(chunk) => prefixed("+ ", chunk),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clip(text: &str) -> String {
    let text = text.trim_end();
    match text.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((cut, _)) => format!("{}\n... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

/// Message for the first failing test. `position` is 1-based in run order;
/// hidden tests are named by their `order` instead.
pub fn failure_message(position: usize, report: &TestReport) -> String {
    let status = report.record.status;

    if status == ExecutionStatus::SystemError {
        return SYSTEM_ERROR_MESSAGE.to_string();
    }
    if status == ExecutionStatus::CompilationError {
        // diagnostics concern the submission, not the test data
        return match report.record.stderr.trim() {
            "" => "Compilation failed".to_string(),
            diagnostics => format!("Compilation failed:\n{}", clip(diagnostics)),
        };
    }
    if report.is_hidden {
        return format!("Hidden test #{}: failed", report.order);
    }

    match status {
        ExecutionStatus::RuntimeError if !report.record.stderr.trim().is_empty() => format!(
            "Test #{}: runtime error\n{}",
            position,
            clip(&report.record.stderr)
        ),
        _ => format!("Test #{}: {}", position, status_label(status)),
    }
}

fn case_block(position: usize, case: &TestCase, report: Option<&TestReport>) -> String {
    let passed = report.is_some_and(|r| r.passed);

    if case.is_hidden {
        let verdict = if passed { "passed" } else { "failed" };
        return format!("Hidden test #{}: {}", case.order, verdict);
    }

    let Some(report) = report else {
        return format!("✗ Test #{}: not run", position);
    };

    if passed {
        return format!(
            "✓ Test #{}: passed ({} ms)",
            position, report.record.execution_time_ms
        );
    }

    let status = report.record.status;
    let mut block = format!(
        "✗ Test #{}: {}\nInput:\n{}",
        position,
        status_label(status),
        clip(&case.input)
    );
    match status {
        ExecutionStatus::WrongAnswer => {
            block.push_str("\nDiff (- expected, + actual):\n");
            block.push_str(&clip(&diff(&case.expected_output, &report.record.stdout)));
        }
        ExecutionStatus::RuntimeError | ExecutionStatus::CompilationError => {
            if !report.record.stderr.trim().is_empty() {
                block.push_str("\nError:\n");
                block.push_str(&clip(&report.record.stderr));
            }
        }
        ExecutionStatus::SystemError => {
            block.push('\n');
            block.push_str(SYSTEM_ERROR_MESSAGE);
        }
        ExecutionStatus::Accepted
        | ExecutionStatus::TimeLimitExceeded
        | ExecutionStatus::MemoryLimitExceeded => {}
    }
    block
}

/// Human-readable report: one block per test case in run order, then a summary
pub fn render(outcome: &GradingOutcome, test_cases: &[TestCase]) -> String {
    if outcome.overall_status == OverallStatus::Rejected {
        return format!(
            "Submission rejected: {}",
            outcome.first_failure_message.as_deref().unwrap_or("disallowed code")
        );
    }

    let mut ordered: Vec<&TestCase> = test_cases.iter().collect();
    ordered.sort_by_key(|c| c.order);

    let mut blocks: Vec<String> = ordered
        .iter()
        .enumerate()
        .map(|(i, case)| case_block(i + 1, case, outcome.per_test.get(i)))
        .collect();

    if outcome.overall_status == OverallStatus::SystemError && outcome.per_test.is_empty() {
        blocks.push(SYSTEM_ERROR_MESSAGE.to_string());
    }

    blocks.push(format!(
        "Passed {}/{} tests. Score: {}/{}",
        outcome.passed_count, outcome.total_count, outcome.weighted_score, outcome.max_score
    ));

    blocks.join("\n\n")
}
