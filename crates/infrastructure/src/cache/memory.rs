//! In-process cache for embedded deployments and tests

use super::{CacheStats, StatsRecorder};
use async_trait::async_trait;
use checkin_domain::CacheStore;
use checkin_errors::CheckinResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    stats: Arc<StatsRecorder>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 清理已过期的条目
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CheckinResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                debug!("Cache HIT: {}", key);
                self.stats.hit();
                Ok(Some(entry.value.clone()))
            }
            _ => {
                debug!("Cache MISS: {}", key);
                self.stats.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CheckinResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.stats.set();
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CheckinResult<usize> {
        let mut entries = self.entries.write().await;
        let deleted = keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count();
        self.stats.deleted(deleted);
        Ok(deleted)
    }
}
