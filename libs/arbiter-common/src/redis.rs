//! Redis queue layout shared by the API and the worker.
//! Keys are deterministic so both sides agree without coordination.

use crate::types::{GradeJob, GradeResponse, Language};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

pub const QUEUE_PREFIX: &str = "arbiter:queue";
pub const RESULT_PREFIX: &str = "arbiter:result";
pub const STATUS_PREFIX: &str = "arbiter:status";
pub const CANCEL_PREFIX: &str = "arbiter:cancel";

/// Results and statuses expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86400;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_CANCELLED: &str = "cancelled";

pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn cancel_key(job_id: &Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, job_id)
}

fn type_error(what: &'static str, e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, what, e.to_string()))
}

/// Statuses are stored as JSON strings, the same encoding a finished job's
/// `OverallStatus` gets
pub fn encode_status(status: &str) -> String {
    serde_json::Value::from(status).to_string()
}

pub fn decode_status(payload: &str) -> Option<String> {
    serde_json::from_str(payload).ok()
}

/// Push a job to its language queue (RPUSH, FIFO with BLPOP)
pub async fn push_job(conn: &mut redis::aio::ConnectionManager, job: &GradeJob) -> RedisResult<()> {
    let queue = queue_name(&job.request.submission.language);
    let payload = serde_json::to_string(job).map_err(|e| type_error("serialization error", e))?;

    let _: () = conn.rpush(&queue, payload).await?;
    let _: () = conn
        .set_ex(status_key(&job.id), encode_status(STATUS_QUEUED), RESULT_TTL_SECONDS)
        .await?;
    Ok(())
}

/// Pop a job from the language queue.
/// BLPOP with timeout so the caller can observe shutdown between polls.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    language: &Language,
    timeout_seconds: f64,
) -> RedisResult<Option<GradeJob>> {
    let queue = queue_name(language);
    let result: Option<(String, String)> = conn.blpop(&queue, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradeJob =
                serde_json::from_str(&payload).map_err(|e| type_error("deserialization error", e))?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store the graded response and its overall status
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
    response: &GradeResponse,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(response).map_err(|e| type_error("serialization error", e))?;
    let _: () = conn
        .set_ex(result_key(job_id), payload, RESULT_TTL_SECONDS)
        .await?;

    let status = serde_json::to_string(&response.outcome.overall_status)
        .map_err(|e| type_error("serialization error", e))?;
    let _: () = conn
        .set_ex(status_key(job_id), status, RESULT_TTL_SECONDS)
        .await?;

    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<GradeResponse>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let response: GradeResponse =
                serde_json::from_str(&data).map_err(|e| type_error("deserialization error", e))?;
            Ok(Some(response))
        }
        None => Ok(None),
    }
}

/// Mark a job as cancelled. Advisory: only jobs not yet started are skipped.
pub async fn cancel_job(conn: &mut redis::aio::ConnectionManager, job_id: &Uuid) -> RedisResult<()> {
    conn.set_ex(cancel_key(job_id), "1", RESULT_TTL_SECONDS).await
}

/// Record that a cancelled job was skipped; this is its terminal status
pub async fn mark_cancelled(conn: &mut redis::aio::ConnectionManager, job_id: &Uuid) -> RedisResult<()> {
    conn.set_ex(status_key(job_id), encode_status(STATUS_CANCELLED), RESULT_TTL_SECONDS)
        .await
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<String>> {
    let payload: Option<String> = conn.get(status_key(job_id)).await?;
    Ok(payload.as_deref().and_then(decode_status))
}

pub async fn is_cancelled(conn: &mut redis::aio::ConnectionManager, job_id: &Uuid) -> RedisResult<bool> {
    conn.exists(cancel_key(job_id)).await
}
