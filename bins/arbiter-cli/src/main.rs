mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Grade and screen submissions locally", long_about = None)]
struct Cli {
    /// Path to languages.json (defaults to ARBITER_LANGUAGES_PATH or the built-in toolchains)
    #[arg(long, global = true)]
    languages_config: Option<PathBuf>,

    /// Log engine activity to stderr
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a source file against a JSON list of test cases
    Grade {
        /// Source file to grade
        source: PathBuf,

        /// Language name (python, javascript, cpp)
        #[arg(short, long)]
        language: String,

        /// JSON file with the test cases
        #[arg(short, long)]
        tests: PathBuf,

        /// Points pool distributed by weight
        #[arg(short, long, default_value = "100")]
        points: u32,

        /// CPU time limit per test case in milliseconds
        #[arg(long, default_value = "2000")]
        time_limit_ms: u32,

        /// Memory limit per test case in MB
        #[arg(long, default_value = "256")]
        memory_limit_mb: u32,

        /// Print the full outcome as JSON instead of the feedback text
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run only the safety screen on a source file
    Screen {
        /// Source file to screen
        source: PathBuf,

        /// Language name (python, javascript, cpp)
        #[arg(short, long)]
        language: String,
    },

    /// List configured languages and whether their toolchains are installed
    Languages,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = commands::engine_config(cli.languages_config);

    let success = match cli.command {
        Commands::Grade {
            source,
            language,
            tests,
            points,
            time_limit_ms,
            memory_limit_mb,
            json,
        } => {
            let options = commands::GradeOptions {
                points,
                time_limit_ms,
                memory_limit_mb,
                json,
            };
            commands::grade(&config, &source, &language, &tests, options).await?
        }
        Commands::Screen { source, language } => commands::screen(&source, &language)?,
        Commands::Languages => {
            commands::list_languages(&config).await;
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
