//! Look-aside caching for check-in data
//!
//! The cache is never authoritative. Entries are populated on read misses and
//! deleted after the owning write commits.

pub mod consistency;
pub mod manager;
pub mod memory;

use async_trait::async_trait;
pub use consistency::*;
pub use manager::*;
pub use memory::*;

use checkin_domain::CacheStore;
use checkin_errors::{CheckinError, CheckinResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default entry TTL (30 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache key prefix patterns for different data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePrefix {
    Task,
    Record,
    Audit,
    Group,
}

impl CachePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePrefix::Task => "task",
            CachePrefix::Record => "record",
            CachePrefix::Audit => "audit",
            CachePrefix::Group => "group",
        }
    }
}

/// Builds cache keys under an optional namespace prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn build(&self, prefix: CachePrefix, segments: &[&str]) -> String {
        let key = format!("{}:{}", prefix.as_str(), segments.join(":"));
        if self.namespace.is_empty() {
            key
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    pub fn task(&self, task_id: i64) -> String {
        self.build(CachePrefix::Task, &[&task_id.to_string()])
    }

    pub fn group_tasks(&self, group_id: i64) -> String {
        self.build(CachePrefix::Task, &["group", &group_id.to_string()])
    }

    pub fn record(&self, task_id: i64, user_id: i64) -> String {
        self.build(
            CachePrefix::Record,
            &[&task_id.to_string(), &user_id.to_string()],
        )
    }

    pub fn task_records(&self, task_id: i64) -> String {
        self.build(CachePrefix::Record, &["task", &task_id.to_string()])
    }

    pub fn user_records(&self, user_id: i64) -> String {
        self.build(CachePrefix::Record, &["user", &user_id.to_string()])
    }

    pub fn audit(&self, application_id: i64) -> String {
        self.build(CachePrefix::Audit, &[&application_id.to_string()])
    }

    pub fn group_audits(&self, group_id: i64) -> String {
        self.build(CachePrefix::Audit, &["group", &group_id.to_string()])
    }

    pub fn user_audits(&self, user_id: i64) -> String {
        self.build(CachePrefix::Audit, &["user", &user_id.to_string()])
    }

    pub fn group(&self, group_id: i64) -> String {
        self.build(CachePrefix::Group, &[&group_id.to_string()])
    }

    /// Keys touched by a new check-in record
    pub fn record_keys(&self, task_id: i64, user_id: i64) -> Vec<String> {
        vec![
            self.record(task_id, user_id),
            self.task_records(task_id),
            self.user_records(user_id),
        ]
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deleted(&self, count: usize) {
        self.deletes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Extension trait for convenient type-safe caching
#[async_trait]
pub trait CacheStoreExt: Send + Sync {
    async fn get_typed<T>(&self, key: &str) -> CheckinResult<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send + Sync;

    async fn set_typed<T>(&self, key: &str, value: &T, ttl: Duration) -> CheckinResult<()>
    where
        T: serde::Serialize + Send + Sync;
}

#[async_trait]
impl<C: CacheStore + ?Sized> CacheStoreExt for C {
    async fn get_typed<U>(&self, key: &str) -> CheckinResult<Option<U>>
    where
        U: serde::de::DeserializeOwned + Send + Sync,
    {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CheckinError::CacheError(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_typed<U>(&self, key: &str, value: &U, ttl: Duration) -> CheckinResult<()>
    where
        U: serde::Serialize + Send + Sync,
    {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CheckinError::CacheError(e.to_string()))?;
        self.set(key, &bytes, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let keys = CacheKeys::default();
        assert_eq!(keys.task(7), "task:7");
        assert_eq!(keys.group_tasks(3), "task:group:3");
        assert_eq!(keys.record(7, 9), "record:7:9");
        assert_eq!(keys.task_records(7), "record:task:7");
        assert_eq!(keys.user_records(9), "record:user:9");
        assert_eq!(keys.audit(1), "audit:1");
        assert_eq!(keys.group_audits(3), "audit:group:3");
        assert_eq!(keys.user_audits(9), "audit:user:9");
        assert_eq!(keys.group(3), "group:3");
    }

    #[test]
    fn test_key_namespace() {
        let keys = CacheKeys::new("checkin");
        assert_eq!(keys.task(1), "checkin:task:1");
        assert_eq!(
            keys.record_keys(1, 2),
            vec![
                "checkin:record:1:2".to_string(),
                "checkin:record:task:1".to_string(),
                "checkin:record:user:2".to_string(),
            ]
        );
    }
}
