//! Isolated Executor - One Fresh Process per (Program, Input)
//!
//! **Execution Model (compile-once):**
//! 1. `prepare`: write the submission into a build directory and run the
//!    language's compile/check step once
//! 2. `run`: copy the prepared artifacts into a fresh scratch directory and
//!    execute them under the sandbox with the test's input on stdin
//! 3. Both directories are `TempDir`s, removed on every exit path
//!
//! **Classification (first match wins):**
//! - Watchdog kill or SIGXCPU → TimeLimitExceeded
//! - CPU time over `time_limit_ms`, however the process ended → TimeLimitExceeded
//! - SIGKILL at or past the time limit → TimeLimitExceeded (RLIMIT_CPU hard cap)
//! - SIGKILL before the time limit → MemoryLimitExceeded
//! - Sampled RSS over the cap (runtimes without RLIMIT_AS) → MemoryLimitExceeded
//! - The runtime's own allocation-failure exit → MemoryLimitExceeded
//! - Any other crash or non-zero exit → RuntimeError
//! - Exit 0 with truncated stdout → RuntimeError
//! - Exit 0 → Accepted (the grader then compares output)
//! - Host-side failure anywhere → SystemError
//!
//! Every call yields exactly one `ExecutionRecord`; nothing escapes as an error.

use anyhow::{Context, Result};
use arbiter_common::{
    EngineConfig, EntryPoint, ExecutionRecord, ExecutionStatus, Language, NetworkIsolation,
    ResourceLimits, Submission,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, error, info};

use crate::languages::{LanguageConfig, LanguageConfigManager, TemplateVars};
use crate::sandbox::{run_sandboxed, ProcessOutcome, SandboxCommand, SandboxLimits, Termination};

/// Largest accepted test input
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

const SOLUTION_HARNESS: &str = include_str!("harness/solution.py");
const SOLUTION_HARNESS_FILE: &str = "harness.py";

const CPP_BAD_ALLOC: &str = "terminate called after throwing an instance of 'std::bad_alloc'";
const V8_HEAP_EXHAUSTED: &str = "Allocation failed - JavaScript heap out of memory";

/// Runs submitted code.
///
/// `prepare` happens once per grading, `run` once per test case.
#[async_trait]
pub trait Executor: Send + Sync {
    type Program: Send + Sync;

    /// Materialize and build the submission. A failure is already a final
    /// record (`CompilationError` or `SystemError`).
    async fn prepare(&self, submission: &Submission) -> Result<Self::Program, ExecutionRecord>;

    /// Run a prepared program against one input
    async fn run(
        &self,
        program: &Self::Program,
        input: &str,
        limits: &ResourceLimits,
    ) -> ExecutionRecord;

    /// Prepare and run in one step
    async fn execute(
        &self,
        submission: &Submission,
        input: &str,
        limits: &ResourceLimits,
    ) -> ExecutionRecord {
        match self.prepare(submission).await {
            Ok(program) => self.run(&program, input, limits).await,
            Err(record) => record,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Watchdog slack on top of the time limit
    pub wall_margin: Duration,
    pub max_output_bytes: usize,
    pub compile_time_limit_ms: u32,
    pub compile_memory_limit_mb: u32,
    pub network: NetworkIsolation,
    pub scratch_root: Option<PathBuf>,
}

impl From<&EngineConfig> for ExecutorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            wall_margin: Duration::from_millis(config.wall_margin_ms),
            max_output_bytes: config.max_output_bytes,
            compile_time_limit_ms: config.compile_time_limit_ms,
            compile_memory_limit_mb: config.compile_memory_limit_mb,
            network: config.network_isolation,
            scratch_root: config.scratch_root.clone(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Submission built and ready to run
#[derive(Debug)]
pub struct PreparedProgram {
    language: Language,
    config: LanguageConfig,
    entry_file: String,
    artifacts: Vec<String>,
    build_dir: TempDir,
}

impl PreparedProgram {
    pub fn language(&self) -> Language {
        self.language
    }

    pub fn build_dir(&self) -> &Path {
        self.build_dir.path()
    }
}

/// Process-sandbox executor
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    languages: Arc<LanguageConfigManager>,
    settings: ExecutorSettings,
}

impl SandboxExecutor {
    pub fn new(languages: Arc<LanguageConfigManager>, settings: ExecutorSettings) -> Self {
        Self {
            languages,
            settings,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let languages = LanguageConfigManager::load_or_default(&config.languages_path);
        Self::new(Arc::new(languages), ExecutorSettings::from(config))
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.settings.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("failed to create scratch directory")
    }

    fn address_space(&self, config: &LanguageConfig, memory_mb: u32) -> Option<u64> {
        config.limit_address_space.then(|| {
            (u64::from(memory_mb) + u64::from(config.address_space_overhead_mb)) * 1024 * 1024
        })
    }

    /// Write sources and run the compile step. `Ok(Err(record))` is a
    /// submission-caused failure, `Err` a host-side one.
    async fn build(
        &self,
        submission: &Submission,
        config: &LanguageConfig,
        entry_point: EntryPoint,
        build_dir: &Path,
    ) -> Result<std::result::Result<(String, Vec<String>), ExecutionRecord>> {
        let source_path = build_dir.join(&config.source_file);
        tokio::fs::write(&source_path, &submission.code)
            .await
            .context("failed to write source file")?;

        let mut artifacts = config.artifacts.clone();
        let entry_file = match entry_point {
            EntryPoint::Stdio => config.entry_file().to_string(),
            EntryPoint::SolutionFunction => {
                tokio::fs::write(build_dir.join(SOLUTION_HARNESS_FILE), SOLUTION_HARNESS)
                    .await
                    .context("failed to write solution harness")?;
                artifacts.push(SOLUTION_HARNESS_FILE.to_string());
                SOLUTION_HARNESS_FILE.to_string()
            }
        };

        let Some(compile) = &config.compile else {
            return Ok(Ok((entry_file, artifacts)));
        };

        let entry_path = build_dir.join(&entry_file);
        let (program, args) = compile.render(&TemplateVars {
            source: &source_path,
            entry: &entry_path,
            dir: build_dir,
            memory_mb: self.settings.compile_memory_limit_mb,
        });

        let limits = SandboxLimits {
            cpu_time_ms: self.settings.compile_time_limit_ms,
            memory_bytes: self.address_space(config, self.settings.compile_memory_limit_mb),
            wall_time: Duration::from_millis(u64::from(self.settings.compile_time_limit_ms))
                + self.settings.wall_margin,
            max_output_bytes: self.settings.max_output_bytes,
            network: self.settings.network,
        };

        let outcome = run_sandboxed(
            SandboxCommand {
                program,
                args,
                working_dir: build_dir.to_path_buf(),
                stdin: Vec::new(),
            },
            limits,
        )
        .await?;

        match outcome.termination {
            Termination::Exited(0) => Ok(Ok((entry_file, artifacts))),
            Termination::Exited(_) => {
                let diagnostics = compiler_diagnostics(&outcome, build_dir);
                Ok(Err(ExecutionRecord::compilation_error(diagnostics)))
            }
            Termination::Signaled(_) | Termination::WatchdogKilled => Ok(Err(
                ExecutionRecord::compilation_error("compilation exceeded its time or memory limit"),
            )),
        }
    }

    async fn run_in_scratch(
        &self,
        program: &PreparedProgram,
        input: &str,
        limits: &ResourceLimits,
    ) -> Result<ExecutionRecord> {
        let run_dir = self.scratch_dir("arbiter-run-")?;

        for artifact in &program.artifacts {
            tokio::fs::copy(program.build_dir.path().join(artifact), run_dir.path().join(artifact))
                .await
                .with_context(|| format!("failed to stage artifact {}", artifact))?;
        }

        let source_path = run_dir.path().join(&program.config.source_file);
        let entry_path = run_dir.path().join(&program.entry_file);
        let (command, args) = program.config.run.render(&TemplateVars {
            source: &source_path,
            entry: &entry_path,
            dir: run_dir.path(),
            memory_mb: limits.memory_limit_mb.get(),
        });

        let sandbox_limits = SandboxLimits {
            cpu_time_ms: limits.time_limit_ms.get(),
            memory_bytes: self.address_space(&program.config, limits.memory_limit_mb.get()),
            wall_time: limits.time_limit() + self.settings.wall_margin,
            max_output_bytes: self.settings.max_output_bytes,
            network: self.settings.network,
        };

        let outcome = run_sandboxed(
            SandboxCommand {
                program: command,
                args,
                working_dir: run_dir.path().to_path_buf(),
                stdin: input.as_bytes().to_vec(),
            },
            sandbox_limits,
        )
        .await?;

        Ok(classify(outcome, limits, !program.config.limit_address_space))
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    type Program = PreparedProgram;

    #[tracing::instrument(skip(self, submission), fields(language = %submission.language))]
    async fn prepare(&self, submission: &Submission) -> Result<PreparedProgram, ExecutionRecord> {
        let config = self.languages.get_config(&submission.language).map_err(|e| {
            error!(error = %e, "Language is not configured");
            ExecutionRecord::system_error(e.to_string())
        })?;

        let entry_point = resolve_entry_point(submission);
        if entry_point == EntryPoint::SolutionFunction && submission.language != Language::Python {
            let detail = format!(
                "solution-function entry point is not supported for {}",
                submission.language
            );
            error!("{}", detail);
            return Err(ExecutionRecord::system_error(detail));
        }

        let build_dir = self.scratch_dir("arbiter-build-").map_err(|e| {
            error!(error = %e, "Failed to create build directory");
            ExecutionRecord::system_error(format!("{:#}", e))
        })?;

        match self.build(submission, config, entry_point, build_dir.path()).await {
            Ok(Ok((entry_file, artifacts))) => {
                debug!(?entry_point, entry_file = %entry_file, "Submission prepared");
                Ok(PreparedProgram {
                    language: submission.language,
                    config: config.clone(),
                    entry_file,
                    artifacts,
                    build_dir,
                })
            }
            Ok(Err(record)) => {
                info!("Compilation failed");
                Err(record)
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Build step failed on the host");
                Err(ExecutionRecord::system_error(format!("{:#}", e)))
            }
        }
    }

    #[tracing::instrument(skip(self, program, input, limits), fields(language = %program.language))]
    async fn run(
        &self,
        program: &PreparedProgram,
        input: &str,
        limits: &ResourceLimits,
    ) -> ExecutionRecord {
        if input.len() > MAX_INPUT_BYTES {
            let detail = format!(
                "test input is {} bytes, the limit is {} bytes",
                input.len(),
                MAX_INPUT_BYTES
            );
            error!("{}", detail);
            return ExecutionRecord::system_error(detail);
        }

        match self.run_in_scratch(program, input, limits).await {
            Ok(record) => {
                debug!(
                    status = %record.status,
                    execution_time_ms = record.execution_time_ms,
                    memory_used_kb = ?record.memory_used_kb,
                    "Run finished"
                );
                record
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Execution failed on the host");
                ExecutionRecord::system_error(format!("{:#}", e))
            }
        }
    }
}

/// Entry-point convention for a submission: the declared one, or for Python
/// code that defines `solution(...)` the solution-function convention
pub fn resolve_entry_point(submission: &Submission) -> EntryPoint {
    if let Some(entry_point) = submission.entry_point {
        return entry_point;
    }
    let defines_solution = submission.code.lines().any(|line| {
        line.trim_start()
            .strip_prefix("def solution")
            .is_some_and(|rest| rest.trim_start().starts_with('('))
    });
    if submission.language == Language::Python && defines_solution {
        EntryPoint::SolutionFunction
    } else {
        EntryPoint::Stdio
    }
}

fn compiler_diagnostics(outcome: &ProcessOutcome, build_dir: &Path) -> String {
    let raw = if outcome.stderr.is_empty() {
        &outcome.stdout
    } else {
        &outcome.stderr
    };
    let text = String::from_utf8_lossy(raw);
    // show paths relative to the submission
    let prefix = format!("{}/", build_dir.display());
    text.replace(&prefix, "").trim_end().to_string()
}

/// Allocation failure reported by the runtime itself: an uncaught Python
/// `MemoryError` (exit 1, traceback ending in it) or an abort after a C++ or
/// V8 allocation failure. Text the program prints under other exits is not
/// trusted.
fn memory_exhausted(termination: Termination, stderr: &str) -> bool {
    match termination {
        Termination::Exited(1) => stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .is_some_and(|last| last == "MemoryError" || last.starts_with("MemoryError:")),
        Termination::Signaled(libc::SIGABRT) => stderr.lines().map(str::trim).any(|line| {
            line == CPP_BAD_ALLOC
                || (line.starts_with("FATAL ERROR:") && line.ends_with(V8_HEAP_EXHAUSTED))
        }),
        _ => false,
    }
}

/// Map a finished process onto an execution status
pub fn classify(
    outcome: ProcessOutcome,
    limits: &ResourceLimits,
    enforce_sampled_memory: bool,
) -> ExecutionRecord {
    let execution_time_ms = u32::try_from(outcome.elapsed.as_millis()).unwrap_or(u32::MAX);
    let memory_used_kb = outcome
        .peak_memory_kb
        .map(|kb| u32::try_from(kb).unwrap_or(u32::MAX));
    let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

    let limit_kb = limits.memory_limit_mb.get().saturating_mul(1024);
    let over_sampled_cap = enforce_sampled_memory && memory_used_kb.is_some_and(|kb| kb > limit_kb);
    let over_cpu_limit = outcome
        .cpu_time
        .is_some_and(|cpu| cpu > limits.time_limit());

    let status = match outcome.termination {
        Termination::WatchdogKilled | Termination::Signaled(libc::SIGXCPU) => {
            ExecutionStatus::TimeLimitExceeded
        }
        _ if over_cpu_limit => ExecutionStatus::TimeLimitExceeded,
        Termination::Signaled(libc::SIGKILL) if execution_time_ms >= limits.time_limit_ms.get() => {
            ExecutionStatus::TimeLimitExceeded
        }
        Termination::Signaled(libc::SIGKILL) => ExecutionStatus::MemoryLimitExceeded,
        _ if over_sampled_cap => ExecutionStatus::MemoryLimitExceeded,
        Termination::Exited(0) => {
            if outcome.stdout_truncated {
                stderr.push_str("\noutput limit exceeded");
                ExecutionStatus::RuntimeError
            } else if outcome.output_incomplete {
                stderr.push_str("\noutput was still open after the program exited");
                ExecutionStatus::RuntimeError
            } else {
                ExecutionStatus::Accepted
            }
        }
        Termination::Exited(_) | Termination::Signaled(_) => {
            if memory_exhausted(outcome.termination, &stderr) {
                ExecutionStatus::MemoryLimitExceeded
            } else {
                ExecutionStatus::RuntimeError
            }
        }
    };

    ExecutionRecord {
        status,
        stdout,
        stderr,
        execution_time_ms,
        memory_used_kb,
    }
}
