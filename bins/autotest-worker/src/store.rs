//! Settings lookup and result publication, behind a trait so the job runner
//! can be driven without a Redis server.

use anyhow::Result;
use async_trait::async_trait;
use autotest_common::redis;
use autotest_common::types::{Credentials, JobResult, Settings};
use ::redis::aio::ConnectionManager;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Mutex;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_settings(&self, settings_id: &str) -> Result<Option<Settings>>;

    /// Record that `settings_id` was used at `timestamp` (unix seconds).
    async fn touch_settings(&self, settings_id: &str, settings: &Settings, timestamp: i64) -> Result<()>;

    async fn get_credentials(&self, user: &str) -> Result<Option<Credentials>>;

    async fn publish_result(&self, test_id: &str, result: &JobResult) -> Result<()>;
}

pub struct RedisStore {
    conn: ConnectionManager,
    result_ttl_secs: u64,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, result_ttl_secs: u64) -> Self {
        Self { conn, result_ttl_secs }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get_settings(&self, settings_id: &str) -> Result<Option<Settings>> {
        // ConnectionManager is a cheap handle onto one multiplexed connection.
        let mut conn = self.conn.clone();
        Ok(redis::get_settings(&mut conn, settings_id).await?)
    }

    async fn touch_settings(&self, settings_id: &str, settings: &Settings, timestamp: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut settings = settings.clone();
        settings.last_access = Some(timestamp);
        redis::put_settings(&mut conn, settings_id, &settings).await?;
        Ok(())
    }

    async fn get_credentials(&self, user: &str) -> Result<Option<Credentials>> {
        let mut conn = self.conn.clone();
        Ok(redis::get_credentials(&mut conn, user).await?)
    }

    async fn publish_result(&self, test_id: &str, result: &JobResult) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::store_result(&mut conn, test_id, result, self.result_ttl_secs).await?;
        Ok(())
    }
}

/// In-process store; keeps every publication so callers can assert on them.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<HashMap<String, Settings>>,
    credentials: Mutex<HashMap<String, Credentials>>,
    published: Mutex<Vec<(String, JobResult)>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(self, settings_id: &str, settings: Settings) -> Self {
        lock(&self.settings).insert(settings_id.to_string(), settings);
        self
    }

    pub fn published(&self) -> Vec<(String, JobResult)> {
        lock(&self.published).clone()
    }

    pub fn settings(&self, settings_id: &str) -> Option<Settings> {
        lock(&self.settings).get(settings_id).cloned()
    }
}

#[cfg(test)]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[async_trait]
impl JobStore for MemoryStore {
    async fn get_settings(&self, settings_id: &str) -> Result<Option<Settings>> {
        Ok(lock(&self.settings).get(settings_id).cloned())
    }

    async fn touch_settings(&self, settings_id: &str, settings: &Settings, timestamp: i64) -> Result<()> {
        let mut settings = settings.clone();
        settings.last_access = Some(timestamp);
        lock(&self.settings).insert(settings_id.to_string(), settings);
        Ok(())
    }

    async fn get_credentials(&self, user: &str) -> Result<Option<Credentials>> {
        Ok(lock(&self.credentials).get(user).cloned())
    }

    async fn publish_result(&self, test_id: &str, result: &JobResult) -> Result<()> {
        lock(&self.published).push((test_id.to_string(), result.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_touch_updates_last_access() {
        let store = MemoryStore::new().with_settings("7", Settings::default());
        let settings = store.get_settings("7").await.unwrap().unwrap();

        store.touch_settings("7", &settings, 1_700_000_000).await.unwrap();

        assert_eq!(store.settings("7").unwrap().last_access, Some(1_700_000_000));
        assert!(store.get_settings("8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_records_publications() {
        let store = MemoryStore::new();
        store.publish_result("t1", &JobResult::failed("boom")).await.unwrap();

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t1");
        assert_eq!(published[0].1.error.as_deref(), Some("boom"));
    }
}
