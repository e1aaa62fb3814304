//! Redis cache manager implementation

use super::{CacheStats, StatsRecorder};
use async_trait::async_trait;
use checkin_domain::CacheStore;
use checkin_errors::{CheckinError, CheckinResult};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Redis cache backed by a multiplexed connection manager
#[derive(Clone)]
pub struct RedisCacheManager {
    conn: ConnectionManager,
    stats: Arc<StatsRecorder>,
}

impl RedisCacheManager {
    /// Connect and verify the server answers PING
    pub async fn new(redis_url: &str) -> CheckinResult<Self> {
        info!("Creating Redis cache manager with URL: {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| CheckinError::CacheError(e.to_string()))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CheckinError::CacheError(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CheckinError::CacheError(e.to_string()))?;

        info!("Redis cache manager created successfully");
        Ok(Self {
            conn,
            stats: Arc::new(StatsRecorder::default()),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn command_error(&self, command: &str, e: redis::RedisError) -> CheckinError {
        error!("Cache {} failed: {}", command, e);
        self.stats.error();
        CheckinError::CacheError(e.to_string())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> CheckinResult<bool> {
        let mut conn = self.conn.clone();
        let result: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error("PING", e))?;
        Ok(result == "PONG")
    }
}

#[async_trait]
impl CacheStore for RedisCacheManager {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> CheckinResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let result: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error("GET", e))?;

        match result {
            Some(value) => {
                debug!("Cache HIT: {}", key);
                self.stats.hit();
                Ok(Some(value))
            }
            None => {
                debug!("Cache MISS: {}", key);
                self.stats.miss();
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CheckinResult<()> {
        let mut conn = self.conn.clone();
        let ttl_seconds = ttl.as_secs().max(1);
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error("SETEX", e))?;

        self.stats.set();
        Ok(())
    }

    /// One `DEL k1 k2 ...` round trip
    #[instrument(skip(self))]
    async fn delete(&self, keys: &[String]) -> CheckinResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: usize = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error("DEL", e))?;

        debug!("Cache DELETE: {} of {} keys removed", deleted, keys.len());
        self.stats.deleted(deleted);
        Ok(deleted)
    }
}
