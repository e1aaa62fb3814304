//! Cache consistency layer
//!
//! Reads go cache first and fall back to the store on a miss, populating the
//! cache afterwards. Writes happen in the store first; the affected keys are
//! deleted only after the transaction commits, in a single multi-key call.
//! Cache failures are logged and counted, never returned to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use checkin_domain::CacheStore;
use checkin_errors::CheckinResult;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{CacheKeys, DEFAULT_CACHE_TTL};

#[derive(Clone)]
pub struct CacheConsistencyLayer {
    cache: Option<Arc<dyn CacheStore>>,
    keys: CacheKeys,
    ttl: Duration,
}

impl CacheConsistencyLayer {
    pub fn new(cache: Arc<dyn CacheStore>, keys: CacheKeys, ttl: Duration) -> Self {
        Self {
            cache: Some(cache),
            keys,
            ttl,
        }
    }

    pub fn with_defaults(cache: Arc<dyn CacheStore>) -> Self {
        Self::new(cache, CacheKeys::default(), DEFAULT_CACHE_TTL)
    }

    /// 不使用缓存，所有读取直接访问存储
    pub fn disabled() -> Self {
        Self {
            cache: None,
            keys: CacheKeys::default(),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look-aside read of a single entity. `None` from the loader is not cached.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, load: F) -> CheckinResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CheckinResult<Option<T>>> + Send,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            return Ok(Some(value));
        }
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.populate(key, value).await;
        }
        Ok(loaded)
    }

    /// Look-aside read of a list view. Empty lists are cached too.
    pub async fn get_or_load_list<T, F, Fut>(&self, key: &str, load: F) -> CheckinResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CheckinResult<Vec<T>>> + Send,
    {
        if let Some(values) = self.lookup::<Vec<T>>(key).await {
            return Ok(values);
        }
        let loaded = load().await?;
        self.populate(key, &loaded).await;
        Ok(loaded)
    }

    /// Delete the given keys in one call. Must only be called after commit.
    pub async fn invalidate(&self, keys: Vec<String>) {
        let Some(cache) = &self.cache else {
            return;
        };
        if keys.is_empty() {
            return;
        }
        match cache.delete(&keys).await {
            Ok(deleted) => {
                counter!("checkin_cache_invalidations_total").increment(keys.len() as u64);
                debug!(?keys, deleted, "缓存失效完成");
            }
            Err(e) => {
                counter!("checkin_cache_errors_total", "operation" => "delete").increment(1);
                warn!(?keys, error = %e, "缓存失效失败，等待TTL过期");
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    counter!("checkin_cache_hits_total").increment(1);
                    Some(value)
                }
                Err(e) => {
                    counter!("checkin_cache_errors_total", "operation" => "decode").increment(1);
                    warn!(key, error = %e, "缓存数据反序列化失败，按未命中处理");
                    None
                }
            },
            Ok(None) => {
                counter!("checkin_cache_misses_total").increment(1);
                None
            }
            Err(e) => {
                counter!("checkin_cache_errors_total", "operation" => "get").increment(1);
                warn!(key, error = %e, "缓存读取失败，按未命中处理");
                None
            }
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T) {
        let Some(cache) = &self.cache else {
            return;
        };
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                counter!("checkin_cache_errors_total", "operation" => "encode").increment(1);
                warn!(key, error = %e, "缓存数据序列化失败");
                return;
            }
        };
        if let Err(e) = cache.set(key, &bytes, self.ttl).await {
            counter!("checkin_cache_errors_total", "operation" => "set").increment(1);
            warn!(key, error = %e, "缓存写入失败");
        }
    }
}
