// End-to-end grading against real toolchains. Each test returns early when
// the toolchain it needs (python3, g++, node) is not installed on the host.

use arbiter_common::{
    ExecutionStatus, GradeRequest, Language, OverallStatus, ResourceLimits, Submission, TestCase,
};
use arbiter_engine::{Executor, ExecutorSettings, Grader, LanguageConfigManager, SandboxExecutor};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn toolchain_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn python_available() -> bool {
    toolchain_available("python3")
}

fn grader() -> Grader<SandboxExecutor> {
    let executor = SandboxExecutor::new(
        Arc::new(LanguageConfigManager::builtin()),
        ExecutorSettings::default(),
    );
    Grader::new(executor)
}

fn request(code: &str, test_cases: Vec<TestCase>, points_pool: u32, time_limit_ms: u32) -> GradeRequest {
    request_in(Language::Python, code, test_cases, points_pool, time_limit_ms, 256)
}

fn request_in(
    language: Language,
    code: &str,
    test_cases: Vec<TestCase>,
    points_pool: u32,
    time_limit_ms: u32,
    memory_limit_mb: u32,
) -> GradeRequest {
    GradeRequest {
        submission: Submission::new(code, language),
        test_cases,
        points_pool,
        limits: ResourceLimits::new(time_limit_ms, memory_limit_mb).unwrap(),
    }
}

const SQUARE: &str = "def solution(n):\n    return int(n) ** 2\n";

#[tokio::test]
async fn scenario_a_correct_solution_is_accepted() {
    if !python_available() {
        return;
    }

    let req = request(SQUARE, vec![TestCase::new(1, "5", "25")], 100, 1000);
    let response = grader().grade_with_feedback(&req).await;

    assert_eq!(response.outcome.overall_status, OverallStatus::Accepted);
    assert_eq!(response.outcome.weighted_score, 100);
    assert_eq!(response.outcome.per_test[0].record.stdout.trim(), "25");
    assert!(response.feedback.contains("✓ Test #1: passed"));
}

#[tokio::test]
async fn scenario_b_wrong_expectation_scores_zero() {
    if !python_available() {
        return;
    }

    let req = request(SQUARE, vec![TestCase::new(1, "5", "24")], 100, 1000);
    let response = grader().grade_with_feedback(&req).await;

    assert_eq!(response.outcome.overall_status, OverallStatus::WrongAnswer);
    assert_eq!(response.outcome.weighted_score, 0);
    assert!(response.feedback.contains("- 24"));
    assert!(response.feedback.contains("+ 25"));
}

#[tokio::test]
async fn scenario_c_infinite_loop_is_cut_off() {
    if !python_available() {
        return;
    }

    let req = request(
        "while True:\n    pass\n",
        vec![TestCase::new(1, "", "done"), TestCase::new(2, "", "done")],
        100,
        1000,
    );

    let started = Instant::now();
    let outcome = grader().grade(&req).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.overall_status, OverallStatus::TimeLimitExceeded);
    assert_eq!(outcome.per_test.len(), 1);
    assert!(outcome.per_test[0].record.execution_time_ms <= 1500);
    // compile step included
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn scenario_d_weighted_partial_credit() {
    if !python_available() {
        return;
    }

    let req = request(
        SQUARE,
        vec![
            TestCase::new(1, "2", "5").weighted(1),
            TestCase::new(2, "3", "9").weighted(3),
        ],
        10,
        1000,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Partial);
    assert_eq!(outcome.weighted_score, 8);
    assert_eq!(outcome.passed_count, 1);
}

#[tokio::test]
async fn scenario_e_denied_import_is_rejected() {
    // no interpreter needed: nothing may run
    let req = request(
        "import subprocess\nsubprocess.run(['ls'])\n",
        vec![TestCase::new(1, "", "")],
        100,
        1000,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Rejected);
    assert_eq!(outcome.weighted_score, 0);
    assert!(outcome.per_test.is_empty());
}

#[tokio::test]
async fn stdin_program_and_runtime_error() {
    if !python_available() {
        return;
    }

    let req = request(
        "a, b = map(int, input().split())\nprint(a // b)\n",
        vec![TestCase::new(1, "7 2", "3"), TestCase::new(2, "1 0", "0")],
        10,
        1000,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Partial);
    assert_eq!(outcome.per_test.len(), 2);
    assert_eq!(outcome.per_test[1].record.status, ExecutionStatus::RuntimeError);
    assert!(outcome.per_test[1].record.stderr.contains("ZeroDivisionError"));
}

#[tokio::test]
async fn syntax_error_is_compilation_error() {
    if !python_available() {
        return;
    }

    let req = request("def broken(:\n    pass\n", vec![TestCase::new(1, "", "")], 10, 1000);
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::CompilationError);
    assert!(outcome
        .first_failure_message
        .as_deref()
        .is_some_and(|m| m.contains("SyntaxError")));
}

#[tokio::test]
async fn memory_hog_hits_the_cap() {
    if !python_available() {
        return;
    }

    let req = request(
        "x = bytearray(1024 * 1024 * 1024)\nprint(len(x))\n",
        vec![TestCase::new(1, "", "0")],
        10,
        2000,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::MemoryLimitExceeded);
}

#[tokio::test]
async fn solution_arguments_follow_input_shape() {
    if !python_available() {
        return;
    }

    let code = "def solution(*args):\n    return '|'.join(args)\n";
    let req = request(
        code,
        vec![
            TestCase::new(1, "a b c", "a|b|c"),
            TestCase::new(2, "x y\nz\n", "x y|z"),
            TestCase::new(3, "single", "single"),
        ],
        3,
        1000,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Accepted);
}

#[tokio::test]
async fn each_run_gets_a_fresh_directory() {
    if !python_available() {
        return;
    }

    let executor = SandboxExecutor::new(
        Arc::new(LanguageConfigManager::builtin()),
        ExecutorSettings::default(),
    );
    let submission = Submission::new("print(__file__)", Language::Python);
    let limits = ResourceLimits::new(1000, 256).unwrap();

    let program = executor.prepare(&submission).await.unwrap();
    let first = executor.run(&program, "", &limits).await;
    let second = executor.run(&program, "", &limits).await;

    assert_eq!(first.status, ExecutionStatus::Accepted);
    assert_ne!(first.stdout, second.stdout);
    assert!(!std::path::Path::new(first.stdout.trim()).exists());
}

#[tokio::test]
async fn sub_second_limit_is_enforced_in_milliseconds() {
    if !python_available() {
        return;
    }

    // a few hundred ms of CPU: inside RLIMIT_CPU's first second, over the limit
    let req = request(
        "for _ in range(30_000_000):\n    pass\nprint('done')\n",
        vec![TestCase::new(1, "", "done")],
        10,
        200,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::TimeLimitExceeded);
    assert_eq!(outcome.per_test[0].record.status, ExecutionStatus::TimeLimitExceeded);
}

const CPP_PRODUCT: &str = r#"#include <iostream>

int main() {
    long long a, b;
    std::cin >> a >> b;
    std::cout << a * b << std::endl;
    return 0;
}
"#;

#[tokio::test]
async fn cpp_binary_is_built_once_and_run_per_case() {
    if !toolchain_available("g++") {
        return;
    }

    let req = request_in(
        Language::Cpp,
        CPP_PRODUCT,
        vec![TestCase::new(1, "3 4", "12"), TestCase::new(2, "7 7", "49")],
        10,
        2000,
        256,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Accepted);
    assert_eq!(outcome.per_test[1].record.stdout, "49\n");
}

#[tokio::test]
async fn cpp_compile_error_reports_diagnostics() {
    if !toolchain_available("g++") {
        return;
    }

    let req = request_in(
        Language::Cpp,
        "int main() { return undeclared; }\n",
        vec![TestCase::new(1, "", "")],
        10,
        2000,
        256,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::CompilationError);
    let message = outcome.first_failure_message.unwrap_or_default();
    assert!(message.contains("undeclared"));
    // diagnostics name the source relative to the build directory
    assert!(!message.contains("arbiter-build-"));
}

const JS_PRODUCT: &str = r#"let data = '';
process.stdin.on('data', (chunk) => { data += chunk; });
process.stdin.on('end', () => {
    const [a, b] = data.trim().split(/\s+/).map(Number);
    console.log(a * b);
});
"#;

#[tokio::test]
async fn javascript_reads_stdin() {
    if !toolchain_available("node") {
        return;
    }

    let req = request_in(
        Language::JavaScript,
        JS_PRODUCT,
        vec![TestCase::new(1, "6 7", "42"), TestCase::new(2, "5 5", "24")],
        10,
        2000,
        256,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::Partial);
    assert_eq!(outcome.per_test[0].record.stdout, "42\n");
    assert_eq!(outcome.per_test[1].record.status, ExecutionStatus::WrongAnswer);
}

#[tokio::test]
async fn javascript_memory_hog_hits_the_cap() {
    if !toolchain_available("node") {
        return;
    }

    let req = request_in(
        Language::JavaScript,
        "const hoard = [];\nwhile (true) { hoard.push(new Array(1e6).fill(7)); }\n",
        vec![TestCase::new(1, "", "")],
        10,
        5000,
        128,
    );
    let outcome = grader().grade(&req).await;

    assert_eq!(outcome.overall_status, OverallStatus::MemoryLimitExceeded);
}
