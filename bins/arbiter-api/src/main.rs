mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use arbiter_common::EngineConfig;
use arbiter_engine::{Grader, SandboxExecutor};
use axum::Router;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct AppState {
    pub grader: Grader<SandboxExecutor>,
    /// One permit per concurrent grading
    pub permits: Semaphore,
    /// Job queue; `None` when Redis is unreachable at boot
    pub redis: Option<ConnectionManager>,
    pub start_time: Instant,
}

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
            .init();
    }
}

async fn connect_redis(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
    ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Arbiter API booting...");

    metrics::init_metrics();

    let config = EngineConfig::from_env();
    let executor = SandboxExecutor::from_config(&config);
    info!(
        languages = ?executor.languages().list_languages(),
        max_concurrent_gradings = config.max_concurrent_gradings,
        network_isolation = ?config.network_isolation,
        "Executor configured"
    );

    let redis = match connect_redis(&config.redis_url).await {
        Ok(conn) => {
            info!("Connected to Redis: {}", config.redis_url);
            Some(conn)
        }
        Err(e) => {
            warn!("{:#}; job queue endpoints disabled", e);
            None
        }
    };

    let state = Arc::new(AppState {
        grader: Grader::new(executor),
        permits: Semaphore::new(config.max_concurrent_gradings),
        redis,
        start_time: Instant::now(),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, finishing in-flight gradings...");
            }
        })
        .await
        .context("server error")?;

    info!("API shutdown complete");
    Ok(())
}
