// CLI commands for local grading
use anyhow::{bail, Context, Result};
use arbiter_common::{
    EngineConfig, GradeRequest, Language, OverallStatus, ResourceLimits, Submission, TestCase,
};
use arbiter_engine::{screen as screen_source, Grader, SandboxExecutor};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub struct GradeOptions {
    pub points: u32,
    pub time_limit_ms: u32,
    pub memory_limit_mb: u32,
    pub json: bool,
}

/// Test files hold either a bare array or an object with a `test_cases` array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TestFile {
    Bare(Vec<TestCase>),
    Wrapped { test_cases: Vec<TestCase> },
}

pub fn engine_config(languages_config: Option<PathBuf>) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(path) = languages_config {
        config.languages_path = path;
    }
    config
}

fn parse_language(name: &str) -> Result<Language> {
    match Language::from_name(name) {
        Some(language) => Ok(language),
        None => bail!(
            "Unknown language '{}'. Valid options: {:?}",
            name,
            Language::all_variants()
        ),
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read test file {}", path.display()))?;
    let parsed: TestFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test file {}", path.display()))?;

    Ok(match parsed {
        TestFile::Bare(cases) => cases,
        TestFile::Wrapped { test_cases } => test_cases,
    })
}

/// Grade a source file. Returns whether every test case passed.
pub async fn grade(
    config: &EngineConfig,
    source: &Path,
    language: &str,
    tests: &Path,
    options: GradeOptions,
) -> Result<bool> {
    let language = parse_language(language)?;
    let code = read_source(source)?;
    let test_cases = load_test_cases(tests)?;
    let limits = ResourceLimits::new(options.time_limit_ms, options.memory_limit_mb)?;

    let request = GradeRequest {
        submission: Submission::new(code, language),
        test_cases,
        points_pool: options.points,
        limits,
    };

    let grader = Grader::new(SandboxExecutor::from_config(config));
    let response = grader.grade_with_feedback(&request).await;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.feedback);
        println!();
        println!("Overall: {}", response.outcome.overall_status);
        if let Some(fault) = &response.outcome.system_fault {
            eprintln!("System fault: {}", fault);
        }
    }

    Ok(response.outcome.overall_status == OverallStatus::Accepted)
}

/// Screen a source file without running it. Returns whether it is allowed.
pub fn screen(source: &Path, language: &str) -> Result<bool> {
    let language = parse_language(language)?;
    let code = read_source(source)?;

    match screen_source(&code, language) {
        Ok(()) => {
            println!("✓ {} passes the safety screen", source.display());
            Ok(true)
        }
        Err(violation) => {
            println!("✗ {}: {}", source.display(), violation);
            Ok(false)
        }
    }
}

pub async fn list_languages(config: &EngineConfig) {
    let executor = SandboxExecutor::from_config(config);
    let languages = executor.languages().check_availability().await;

    println!("{:<12} {:<24} {}", "LANGUAGE", "NAME", "TOOLCHAIN");
    for lang in languages {
        let toolchain = match (lang.available, lang.version) {
            (true, Some(version)) => version,
            (true, None) => "installed".to_string(),
            (false, _) => "missing".to_string(),
        };
        println!("{:<12} {:<24} {}", lang.language.to_string(), lang.display_name, toolchain);
    }
}
