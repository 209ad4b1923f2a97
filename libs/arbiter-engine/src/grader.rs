//! Grading orchestration.
//!
//! One submission, many test cases, one immutable `GradingOutcome`:
//!
//! 1. Screen once. A violation ends grading as `Rejected` with no process started.
//! 2. Prepare (compile) once, then run test cases in ascending `order`.
//! 3. Compare output only for clean exits.
//! 4. Stop at the first TimeLimitExceeded, MemoryLimitExceeded,
//!    CompilationError or SystemError; later cases are not run.
//! 5. Score = round(points_pool * passed_weight / total_weight), where
//!    total_weight counts every case, run or not.

use arbiter_common::{
    ExecutionRecord, ExecutionStatus, GradeRequest, GradeResponse, GradingOutcome, OverallStatus,
    ResourceLimits, Submission, TestCase, TestReport,
};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::comparator;
use crate::executor::Executor;
use crate::feedback;
use crate::screener;

/// Half-up rounding of `points_pool * passed_weight / total_weight`
pub fn weighted_score(points_pool: u32, passed_weight: u64, total_weight: u64) -> u32 {
    if total_weight == 0 {
        return 0;
    }
    let passed_weight = passed_weight.min(total_weight);
    let numerator = u128::from(points_pool) * u128::from(passed_weight) * 2 + u128::from(total_weight);
    let score = numerator / (u128::from(total_weight) * 2);
    u32::try_from(score).unwrap_or(points_pool)
}

/// Submission status from the aggregated results
pub fn overall_status(
    all_passed: bool,
    passed_weight: u64,
    short_circuit: Option<ExecutionStatus>,
) -> OverallStatus {
    if all_passed {
        OverallStatus::Accepted
    } else if passed_weight > 0 {
        OverallStatus::Partial
    } else {
        short_circuit
            .and_then(OverallStatus::from_short_circuit)
            .unwrap_or(OverallStatus::WrongAnswer)
    }
}

pub struct Grader<E: Executor> {
    executor: E,
}

impl<E: Executor> Grader<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub async fn grade(&self, request: &GradeRequest) -> GradingOutcome {
        self.grade_submission(
            &request.submission,
            &request.test_cases,
            request.points_pool,
            &request.limits,
        )
        .await
    }

    /// Grade and render learner feedback
    pub async fn grade_with_feedback(&self, request: &GradeRequest) -> GradeResponse {
        let outcome = self.grade(request).await;
        let feedback = feedback::render(&outcome, &request.test_cases);
        GradeResponse { outcome, feedback }
    }

    #[tracing::instrument(
        skip_all,
        fields(language = %submission.language, test_count = test_cases.len(), points_pool = points_pool)
    )]
    pub async fn grade_submission(
        &self,
        submission: &Submission,
        test_cases: &[TestCase],
        points_pool: u32,
        limits: &ResourceLimits,
    ) -> GradingOutcome {
        let total_count = u32::try_from(test_cases.len()).unwrap_or(u32::MAX);

        if let Err(violation) = screener::screen(&submission.code, submission.language) {
            info!(violation = %violation, "Submission rejected by safety screen");
            return GradingOutcome {
                per_test: Vec::new(),
                passed_count: 0,
                total_count,
                weighted_score: 0,
                max_score: points_pool,
                overall_status: OverallStatus::Rejected,
                worst_execution_time_ms: 0,
                first_failure_message: Some(violation.to_string()),
                system_fault: None,
                graded_at: Utc::now(),
            };
        }

        if test_cases.is_empty() {
            error!("Submission has no test cases");
            return GradingOutcome {
                per_test: Vec::new(),
                passed_count: 0,
                total_count: 0,
                weighted_score: 0,
                max_score: points_pool,
                overall_status: OverallStatus::SystemError,
                worst_execution_time_ms: 0,
                first_failure_message: Some(feedback::SYSTEM_ERROR_MESSAGE.to_string()),
                system_fault: Some("no test cases configured".to_string()),
                graded_at: Utc::now(),
            };
        }

        // stable: equal orders keep their input position
        let mut ordered: Vec<&TestCase> = test_cases.iter().collect();
        ordered.sort_by_key(|case| case.order);

        let total_weight: u64 = ordered.iter().map(|c| u64::from(c.weight.get())).sum();

        let mut records: Vec<ExecutionRecord> = Vec::with_capacity(ordered.len());
        match self.executor.prepare(submission).await {
            Ok(program) => {
                for case in &ordered {
                    let record = self.executor.run(&program, &case.input, limits).await;
                    let record = match record.status {
                        ExecutionStatus::Accepted => {
                            let matches = comparator::compare(&record.stdout, &case.expected_output);
                            record.into_verdict(matches)
                        }
                        _ => record,
                    };

                    info!(
                        order = case.order,
                        status = %record.status,
                        execution_time_ms = record.execution_time_ms,
                        "Test case finished"
                    );

                    let stop = record.status.is_short_circuit();
                    records.push(record);
                    if stop {
                        break;
                    }
                }
            }
            // charged to the first case so the failure is reported in order
            Err(record) => records.push(record),
        }

        let short_circuit = records
            .last()
            .map(|r| r.status)
            .filter(|s| s.is_short_circuit());
        if let Some(status) = short_circuit {
            let skipped = ordered.len() - records.len();
            if skipped > 0 {
                warn!(status = %status, skipped, "Stopped early; remaining test cases not run");
            }
        }

        let system_fault = records
            .iter()
            .find(|r| r.status == ExecutionStatus::SystemError)
            .map(|r| r.stderr.clone());

        let mut per_test = Vec::with_capacity(records.len());
        let mut passed_weight = 0u64;
        let mut passed_count = 0u32;
        let mut worst_execution_time_ms = 0u32;
        let mut first_failure_message = None;

        for (position, (case, record)) in ordered.iter().zip(records).enumerate() {
            let passed = record.status == ExecutionStatus::Accepted;
            if passed {
                passed_weight += u64::from(case.weight.get());
                passed_count += 1;
            }
            worst_execution_time_ms = worst_execution_time_ms.max(record.execution_time_ms);

            let report = TestReport {
                order: case.order,
                is_hidden: case.is_hidden,
                weight: case.weight.get(),
                passed,
                record,
            };

            if !passed && first_failure_message.is_none() {
                first_failure_message = Some(feedback::failure_message(position + 1, &report));
            }

            let report = if case.is_hidden || report.record.status == ExecutionStatus::SystemError {
                TestReport {
                    record: report.record.redacted(),
                    ..report
                }
            } else {
                report
            };
            per_test.push(report);
        }

        let all_passed = passed_count == total_count;
        let overall_status = overall_status(all_passed, passed_weight, short_circuit);

        if let Some(fault) = &system_fault {
            error!(fault = %fault, "Grading hit a system error; needs investigation");
        }

        info!(
            overall_status = %overall_status,
            passed_count,
            total_count,
            "Grading finished"
        );

        GradingOutcome {
            per_test,
            passed_count,
            total_count,
            weighted_score: weighted_score(points_pool, passed_weight, total_weight),
            max_score: points_pool,
            overall_status,
            worst_execution_time_ms,
            first_failure_message,
            system_fault,
            graded_at: Utc::now(),
        }
    }
}
