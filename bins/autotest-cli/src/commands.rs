// CLI commands for operating an autotest deployment
use anyhow::{Context, Result, bail};
use autotest_common::redis;
use autotest_common::types::{Job, Settings};
use std::collections::HashMap;

/// Message stored in `_error` of settings expired by `clean`.
pub const EXPIRED_SETTINGS_ERROR: &str = "Settings expired";

pub async fn connect(redis_url: &str) -> Result<::redis::aio::ConnectionManager> {
    let client = ::redis::Client::open(redis_url)
        .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Parse `KEY=VALUE` pairs given on the command line.
pub fn parse_env(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{}'", pair);
        };
        if key.is_empty() {
            bail!("Environment variable name cannot be empty in '{}'", pair);
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

pub fn build_job(
    settings_id: String,
    test_id: String,
    files_url: String,
    categories: Vec<String>,
    user: String,
    env: &[String],
) -> Result<Job> {
    if categories.is_empty() {
        bail!("At least one --category is required");
    }
    Ok(Job {
        settings_id,
        test_id,
        files_url,
        categories,
        user,
        test_env_vars: parse_env(env)?,
    })
}

pub async fn enqueue(conn: &mut ::redis::aio::ConnectionManager, queue: &str, job: &Job) -> Result<()> {
    redis::push_job(conn, queue, job).await?;
    let waiting = redis::queue_length(conn, queue).await?;
    println!("📥 Enqueued test {} on {} ({} waiting)", job.test_id, queue, waiting);
    Ok(())
}

pub async fn show_result(conn: &mut ::redis::aio::ConnectionManager, test_id: &str) -> Result<()> {
    match redis::get_result(conn, test_id).await? {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        None => {
            println!("⏳ No result for {} (still running, expired, or never queued)", test_id);
        }
    }
    Ok(())
}

pub async fn queue_stats(conn: &mut ::redis::aio::ConnectionManager, queues: &[String]) -> Result<()> {
    println!("{:<20} {:>8}", "QUEUE", "WAITING");
    for queue in queues {
        let waiting = redis::queue_length(conn, queue).await?;
        println!("{:<20} {:>8}", queue, waiting);
    }
    Ok(())
}

/// Ids of settings last used before `cutoff` (unix seconds), or never used
/// at all. Settings that already carry an error are left alone.
pub fn expired_settings(settings: &[(String, Settings)], cutoff: i64) -> Vec<String> {
    let mut expired: Vec<String> = settings
        .iter()
        .filter(|(_, s)| s.error.is_none())
        .filter(|(_, s)| s.last_access.map_or(true, |t| t < cutoff))
        .map(|(id, _)| id.clone())
        .collect();
    expired.sort();
    expired
}

/// Mark settings unused for `days` days as failed, so later jobs against
/// them report a settings error instead of running.
pub async fn clean_settings(conn: &mut ::redis::aio::ConnectionManager, days: i64, dry_run: bool) -> Result<()> {
    if days < 0 {
        bail!("--days cannot be negative");
    }
    let cutoff = chrono::Utc::now().timestamp() - days * 24 * 60 * 60;
    let all = redis::all_settings(conn).await?;
    let expired = expired_settings(&all, cutoff);

    if expired.is_empty() {
        println!("✅ No settings unused for {} days", days);
        return Ok(());
    }

    for (id, mut settings) in all.into_iter().filter(|(id, _)| expired.contains(id)) {
        if dry_run {
            println!("  would expire {}", id);
            continue;
        }
        settings.error = Some(EXPIRED_SETTINGS_ERROR.to_string());
        redis::put_settings(conn, &id, &settings).await?;
        println!("🗑️  Expired settings {}", id);
    }

    if dry_run {
        println!("\n⚠️  Dry run - {} settings would be expired", expired.len());
    }
    Ok(())
}
