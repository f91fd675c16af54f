use crate::types::{Credentials, Job, JobResult, Settings};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;

/// Redis key layout shared by the worker and the operator CLI.
/// Keeping it here means both sides always agree on where jobs, settings
/// and results live.

pub const QUEUE_PREFIX: &str = "autotest:queue";
pub const RESULT_PREFIX: &str = "autotest:test_result";
pub const SETTINGS_KEY: &str = "autotest:settings";
pub const CREDENTIALS_KEY: &str = "autotest:user_credentials";

/// Default lifetime of a published result
pub const RESULT_TTL_SECONDS: u64 = 3600;

/// Generate the list key backing a named queue
pub fn queue_name(name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, name)
}

/// Generate result key for a job
pub fn result_key(test_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, test_id)
}

fn to_json<T: serde::Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn from_json<T: serde::de::DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Push a job onto a named queue (RPUSH, so consumers see FIFO order)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    job: &Job,
) -> RedisResult<()> {
    let payload = to_json(job)?;
    conn.rpush(queue_name(queue), payload).await
}

/// Pop the next raw job payload from any of the given queues.
/// Uses BLPOP with a timeout so callers can notice shutdown between polls.
/// Decoding is left to [`Job::from_payload`] so a bad payload can still be
/// answered.
pub async fn pop_payload(
    conn: &mut redis::aio::ConnectionManager,
    queues: &[String],
    timeout_seconds: f64,
) -> RedisResult<Option<(String, String)>> {
    let keys: Vec<String> = queues.iter().map(|q| queue_name(q)).collect();
    conn.blpop(keys, timeout_seconds).await
}

/// Number of jobs waiting on a named queue
pub async fn queue_length(conn: &mut redis::aio::ConnectionManager, queue: &str) -> RedisResult<usize> {
    conn.llen(queue_name(queue)).await
}

/// Store a job result. Reruns of the same test_id overwrite the previous value.
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    test_id: &str,
    result: &JobResult,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = to_json(result)?;
    conn.set_ex(result_key(test_id), payload, ttl_seconds).await
}

/// Retrieve a published result
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    test_id: &str,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(test_id)).await?;
    payload.map(|data| from_json(&data)).transpose()
}

/// Look up settings by id
pub async fn get_settings(
    conn: &mut redis::aio::ConnectionManager,
    settings_id: &str,
) -> RedisResult<Option<Settings>> {
    let payload: Option<String> = conn.hget(SETTINGS_KEY, settings_id).await?;
    payload.map(|data| from_json(&data)).transpose()
}

/// Write settings back (used to refresh `_last_access` and to expire settings)
pub async fn put_settings(
    conn: &mut redis::aio::ConnectionManager,
    settings_id: &str,
    settings: &Settings,
) -> RedisResult<()> {
    let payload = to_json(settings)?;
    conn.hset(SETTINGS_KEY, settings_id, payload).await
}

/// All stored settings keyed by id. Entries that do not parse are skipped.
pub async fn all_settings(conn: &mut redis::aio::ConnectionManager) -> RedisResult<Vec<(String, Settings)>> {
    let raw: HashMap<String, String> = conn.hgetall(SETTINGS_KEY).await?;
    Ok(raw
        .into_iter()
        .filter_map(|(id, payload)| from_json(&payload).ok().map(|settings| (id, settings)))
        .collect())
}

/// Credentials the front end registered for downloading a user's files
pub async fn get_credentials(
    conn: &mut redis::aio::ConnectionManager,
    user: &str,
) -> RedisResult<Option<Credentials>> {
    let payload: Option<String> = conn.hget(CREDENTIALS_KEY, user).await?;
    payload.map(|data| from_json(&data)).transpose()
}
