// HTTP route handlers for the Arbiter API

use arbiter_common::redis;
use arbiter_common::{GradeJob, GradeRequest};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::{metrics, AppState};

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Answer for a job without a stored result: cancelled jobs are final,
/// anything else is still pending
fn unfinished_job_response(job_id: Uuid, status: Option<String>) -> Response {
    match status.as_deref() {
        Some(redis::STATUS_CANCELLED) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "job_id": job_id,
                "status": redis::STATUS_CANCELLED,
            })),
        )
            .into_response(),
        _ => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job_id,
                "status": "pending",
            })),
        )
            .into_response(),
    }
}

/// POST /grade - Grade a submission synchronously
pub async fn grade(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GradeRequest>,
) -> Response {
    let language = request.submission.language.to_string();

    // bounded pool: waits here when all slots are busy
    let _permit = match state.permits.acquire().await {
        Ok(permit) => permit,
        Err(_) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "grader is shutting down"),
    };

    metrics::GRADINGS_IN_FLIGHT.inc();
    let started = Instant::now();
    let response = state.grader.grade_with_feedback(&request).await;
    metrics::GRADINGS_IN_FLIGHT.dec();
    metrics::record_grading(&language, &response.outcome, started.elapsed());

    info!(
        language = %language,
        status = %response.outcome.overall_status,
        score = response.outcome.weighted_score,
        max_score = response.outcome.max_score,
        "Graded submission"
    );

    (StatusCode::OK, Json(response)).into_response()
}

/// GET /languages - Configured toolchains and whether they are installed
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Response {
    let languages = state.grader.executor().languages().check_availability().await;
    (StatusCode::OK, Json(languages)).into_response()
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "available_slots": state.permits.available_permits(),
            "queue_enabled": state.redis.is_some(),
        })),
    )
        .into_response()
}

/// GET /metrics - Prometheus metrics
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// POST /jobs - Queue a grading for the worker
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GradeRequest>,
) -> Response {
    let Some(conn) = &state.redis else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "job queue is not configured");
    };

    let job = GradeJob::new(request);
    let language = job.request.submission.language;
    let mut conn = conn.clone();

    match redis::push_job(&mut conn, &job).await {
        Ok(()) => {
            metrics::record_job_queued(&language.to_string());
            info!(
                job_id = %job.id,
                language = %language,
                test_cases = job.request.test_cases.len(),
                "Job queued"
            );
            (StatusCode::CREATED, Json(SubmitResponse { job_id: job.id })).into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to queue job")
        }
    }
}

/// GET /jobs/{job_id} - Fetch a queued grading's response
pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Some(conn) = &state.redis else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "job queue is not configured");
    };
    let Ok(job_uuid) = Uuid::parse_str(&job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id format");
    };

    let mut conn = conn.clone();
    match redis::get_result(&mut conn, &job_uuid).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(None) => match redis::get_status(&mut conn, &job_uuid).await {
            Ok(status) => unfinished_job_response(job_uuid, status),
            Err(e) => {
                error!(job_id = %job_uuid, error = %e, "Failed to fetch job status");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch job status")
            }
        },
        Err(e) => {
            error!(job_id = %job_uuid, error = %e, "Failed to fetch job result");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch job result")
        }
    }
}

/// DELETE /jobs/{job_id} - Advisory cancel; a grading already running completes
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Some(conn) = &state.redis else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "job queue is not configured");
    };
    let Ok(job_uuid) = Uuid::parse_str(&job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id format");
    };

    let mut conn = conn.clone();
    match redis::cancel_job(&mut conn, &job_uuid).await {
        Ok(()) => {
            info!(job_id = %job_uuid, "Job cancellation requested");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            error!(job_id = %job_uuid, error = %e, "Failed to cancel job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to cancel job")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::{GradeResponse, Language, OverallStatus, ResourceLimits, Submission, TestCase};
    use arbiter_engine::{ExecutorSettings, Grader, LanguageConfigManager, SandboxExecutor};
    use tokio::sync::Semaphore;

    fn state() -> Arc<AppState> {
        let executor = SandboxExecutor::new(
            Arc::new(LanguageConfigManager::builtin()),
            ExecutorSettings::default(),
        );
        Arc::new(AppState {
            grader: Grader::new(executor),
            permits: Semaphore::new(2),
            redis: None,
            start_time: Instant::now(),
        })
    }

    fn rejected_request() -> GradeRequest {
        GradeRequest {
            submission: Submission::new("import socket", Language::Python),
            test_cases: vec![TestCase::new(1, "", "")],
            points_pool: 10,
            limits: ResourceLimits::new(1000, 64).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_grade_returns_outcome_and_feedback() {
        let response = grade(State(state()), Json(rejected_request())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let graded: GradeResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(graded.outcome.overall_status, OverallStatus::Rejected);
        assert!(graded.feedback.contains("import socket"));
    }

    #[tokio::test]
    async fn test_queue_endpoints_need_redis() {
        let response = submit_job(State(state()), Json(rejected_request())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = get_job(State(state()), Path(Uuid::new_v4().to_string())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_final() {
        let job_id = Uuid::new_v4();

        let response = unfinished_job_response(job_id, Some(redis::STATUS_CANCELLED.to_string()));
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let job: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(job["status"], "cancelled");

        let queued = unfinished_job_response(job_id, Some(redis::STATUS_QUEUED.to_string()));
        assert_eq!(queued.status(), StatusCode::ACCEPTED);
        assert_eq!(unfinished_job_response(job_id, None).status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_health_reports_slots() {
        let response = health_check(State(state())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["available_slots"], 2);
        assert_eq!(health["queue_enabled"], false);
    }
}
