use anyhow::Context;
use arbiter_common::redis;
use arbiter_common::{EngineConfig, GradeJob, Language};
use arbiter_engine::{Grader, SandboxExecutor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

type ConnectionManager = ::redis::aio::ConnectionManager;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Arbiter Worker booting...");

    let config = EngineConfig::from_env();

    let language_str = std::env::var("WORKER_LANGUAGE").unwrap_or_else(|_| "python".to_string());
    let Some(language) = Language::from_name(&language_str) else {
        anyhow::bail!(
            "invalid WORKER_LANGUAGE '{}', expected one of {:?}",
            language_str,
            Language::all_variants()
        );
    };

    let executor = SandboxExecutor::from_config(&config);
    executor
        .languages()
        .get_config(&language)
        .with_context(|| format!("language '{}' is not configured", language))?;

    info!("Worker configured for language: {}", language);
    info!("Queue: {}", redis::queue_name(&language));

    let client = ::redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.redis_url);

    let grader = Arc::new(Grader::new(executor));
    let slots = config.max_concurrent_gradings;
    let permits = Arc::new(Semaphore::new(slots));

    tokio::select! {
        result = worker_loop(redis_conn, language, grader, permits.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Worker loop stopped");
            }
        },
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, waiting for in-flight gradings...");
        },
    }

    // every slot back means every spawned grading has stored its result
    let _drained = permits.acquire_many(slots as u32).await;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, grader, permits), fields(language = %language))]
async fn worker_loop(
    mut redis_conn: ConnectionManager,
    language: Language,
    grader: Arc<Grader<SandboxExecutor>>,
    permits: Arc<Semaphore>,
) -> anyhow::Result<()> {
    loop {
        // claim a slot before taking work off the queue
        let permit = permits.clone().acquire_owned().await?;

        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(&mut redis_conn, &language, 5.0).await {
            Ok(Some(job)) => {
                let conn = redis_conn.clone();
                let grader = grader.clone();
                tokio::spawn(async move {
                    process_job(conn, &grader, job).await;
                    drop(permit);
                });
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_job(mut conn: ConnectionManager, grader: &Grader<SandboxExecutor>, job: GradeJob) {
    let job_id = job.id;

    match redis::is_cancelled(&mut conn, &job_id).await {
        Ok(true) => {
            info!(job_id = %job_id, "Job cancelled before start, skipping");
            if let Err(e) = redis::mark_cancelled(&mut conn, &job_id).await {
                error!(job_id = %job_id, error = %e, "Failed to record cancellation");
            }
            return;
        }
        Ok(false) => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "Cancellation check failed"),
    }

    info!(
        job_id = %job_id,
        language = %job.request.submission.language,
        test_cases = job.request.test_cases.len(),
        source_size = job.request.submission.code.len(),
        "Received job"
    );

    let start = Instant::now();
    let response = grader.grade_with_feedback(&job.request).await;

    info!(
        job_id = %job_id,
        status = %response.outcome.overall_status,
        score = response.outcome.weighted_score,
        max_score = response.outcome.max_score,
        grading_ms = start.elapsed().as_millis(),
        "Grading completed"
    );

    for (idx, report) in response.outcome.per_test.iter().enumerate() {
        debug!(
            job_id = %job_id,
            test_num = idx + 1,
            status = %report.record.status,
            execution_ms = report.record.execution_time_ms,
            "Test result"
        );
    }

    if let Some(fault) = &response.outcome.system_fault {
        error!(job_id = %job_id, fault = %fault, "Grading hit a system fault");
    }

    match redis::store_result(&mut conn, &job_id, &response).await {
        Ok(()) => info!(job_id = %job_id, "Result persisted to Redis"),
        Err(e) => error!(job_id = %job_id, error = %e, "Failed to persist result"),
    }
}
