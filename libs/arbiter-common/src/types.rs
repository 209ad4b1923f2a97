use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Execution targets the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Cpp,
}

impl Language {
    /// Returns all language variants
    pub fn all_variants() -> &'static [Language] {
        &[Language::Python, Language::JavaScript, Language::Cpp]
    }

    /// Parse a language name (case-insensitive, common aliases accepted)
    pub fn from_name(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "cpp" | "c++" | "cxx" => Some(Language::Cpp),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::Cpp => write!(f, "cpp"),
        }
    }
}

/// How the submitted program receives its input.
///
/// - `Stdio`: the program runs as-is and reads standard input.
/// - `SolutionFunction`: the program defines `solution(...)`, which is called
///   with arguments derived from the input; a non-`None` return value is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    Stdio,
    SolutionFunction,
}

/// Submission under grading (read-only view of the platform's record)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
}

impl Submission {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: EntryPoint) -> Self {
        self.entry_point = Some(entry_point);
        self
    }
}

fn default_weight() -> NonZeroU32 {
    NonZeroU32::MIN
}

/// Test Case Definition (Immutable Input)
/// Iteration order is the ascending `order` field, not the position in the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default = "default_weight")]
    pub weight: NonZeroU32,
    pub order: u32,
}

impl TestCase {
    pub fn new(order: u32, input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            is_hidden: false,
            weight: default_weight(),
            order,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    /// Zero weights are not representable; a zero argument leaves the default of 1.
    pub fn weighted(mut self, weight: u32) -> Self {
        if let Some(weight) = NonZeroU32::new(weight) {
            self.weight = weight;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidLimits {
    #[error("time limit must be greater than 0 ms")]
    ZeroTimeLimit,
    #[error("memory limit must be greater than 0 MB")]
    ZeroMemoryLimit,
}

/// Per-run resource limits. A limit of 0 is rejected, never read as "unlimited".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub time_limit_ms: NonZeroU32,
    pub memory_limit_mb: NonZeroU32,
}

impl ResourceLimits {
    pub fn new(time_limit_ms: u32, memory_limit_mb: u32) -> Result<Self, InvalidLimits> {
        Ok(Self {
            time_limit_ms: NonZeroU32::new(time_limit_ms).ok_or(InvalidLimits::ZeroTimeLimit)?,
            memory_limit_mb: NonZeroU32::new(memory_limit_mb)
                .ok_or(InvalidLimits::ZeroMemoryLimit)?,
        })
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(u64::from(self.time_limit_ms.get()))
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        u64::from(self.memory_limit_mb.get()) * 1024 * 1024
    }
}

/// Final classification of a single run. Each run ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    SystemError,
}

impl ExecutionStatus {
    /// Statuses that stop the remaining test cases from running.
    pub fn is_short_circuit(self) -> bool {
        match self {
            ExecutionStatus::TimeLimitExceeded
            | ExecutionStatus::MemoryLimitExceeded
            | ExecutionStatus::CompilationError
            | ExecutionStatus::SystemError => true,
            ExecutionStatus::Accepted
            | ExecutionStatus::WrongAnswer
            | ExecutionStatus::RuntimeError => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Accepted => "accepted",
            ExecutionStatus::WrongAnswer => "wrong_answer",
            ExecutionStatus::TimeLimitExceeded => "time_limit_exceeded",
            ExecutionStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::CompilationError => "compilation_error",
            ExecutionStatus::SystemError => "system_error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one (code, input) pair.
///
/// The executor produces `Accepted` for a clean exit within limits; the grader
/// turns it into the final verdict with [`ExecutionRecord::into_verdict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u32,
    pub memory_used_kb: Option<u32>,
}

impl ExecutionRecord {
    pub fn system_error(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::SystemError,
            stdout: String::new(),
            stderr: detail.into(),
            execution_time_ms: 0,
            memory_used_kb: None,
        }
    }

    pub fn compilation_error(diagnostics: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::CompilationError,
            stdout: String::new(),
            stderr: diagnostics.into(),
            execution_time_ms: 0,
            memory_used_kb: None,
        }
    }

    /// Consume a clean-exit record and attach the comparator's judgement.
    /// Records with any other status pass through unchanged.
    pub fn into_verdict(self, output_matches: bool) -> Self {
        match self.status {
            ExecutionStatus::Accepted if !output_matches => Self {
                status: ExecutionStatus::WrongAnswer,
                ..self
            },
            _ => self,
        }
    }

    /// Drop captured output, keeping only status and measurements.
    pub fn redacted(self) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            ..self
        }
    }
}

/// Submission-level state after grading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Accepted,
    Partial,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    SystemError,
    Rejected,
}

impl OverallStatus {
    /// Maps a short-circuiting run status onto the submission status.
    pub fn from_short_circuit(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::TimeLimitExceeded => Some(OverallStatus::TimeLimitExceeded),
            ExecutionStatus::MemoryLimitExceeded => Some(OverallStatus::MemoryLimitExceeded),
            ExecutionStatus::CompilationError => Some(OverallStatus::CompilationError),
            ExecutionStatus::SystemError => Some(OverallStatus::SystemError),
            ExecutionStatus::Accepted
            | ExecutionStatus::WrongAnswer
            | ExecutionStatus::RuntimeError => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Accepted => "accepted",
            OverallStatus::Partial => "partial",
            OverallStatus::WrongAnswer => "wrong_answer",
            OverallStatus::TimeLimitExceeded => "time_limit_exceeded",
            OverallStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            OverallStatus::CompilationError => "compilation_error",
            OverallStatus::SystemError => "system_error",
            OverallStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed test case. Hidden cases carry a redacted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub order: u32,
    pub is_hidden: bool,
    pub weight: u32,
    pub passed: bool,
    pub record: ExecutionRecord,
}

/// Aggregate verdict for one submission
///
/// ## Scoring Semantics:
/// - weighted_score: round(max_score * passed_weight / total_weight)
/// - total_weight counts every test case, including those never run
/// - overall_status: Accepted only if every test case ran and passed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub per_test: Vec<TestReport>,
    pub passed_count: u32,
    pub total_count: u32,
    pub weighted_score: u32,
    pub max_score: u32,
    pub overall_status: OverallStatus,
    pub worst_execution_time_ms: u32,
    pub first_failure_message: Option<String>,
    /// Host-side failure detail for operators. Never part of learner feedback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fault: Option<String>,
    pub graded_at: DateTime<Utc>,
}

impl GradingOutcome {
    /// A host fault hit this grading, even if earlier cases passed and the
    /// status reads Partial. Such outcomes are eligible for a manual re-grade.
    pub fn needs_investigation(&self) -> bool {
        self.overall_status == OverallStatus::SystemError || self.system_fault.is_some()
    }

    pub fn executed_count(&self) -> usize {
        self.per_test.len()
    }
}

/// Inbound grading contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeRequest {
    #[serde(flatten)]
    pub submission: Submission,
    pub test_cases: Vec<TestCase>,
    pub points_pool: u32,
    pub limits: ResourceLimits,
}

/// Outbound grading contract: the outcome plus learner-facing feedback text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResponse {
    pub outcome: GradingOutcome,
    pub feedback: String,
}

/// Queued grading job (worker mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeJob {
    pub id: Uuid,
    #[serde(flatten)]
    pub request: GradeRequest,
}

impl GradeJob {
    pub fn new(request: GradeRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
        }
    }
}
