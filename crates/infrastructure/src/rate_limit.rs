//! Fixed-window rate limiters

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use checkin_domain::RateLimiter;
use checkin_errors::{CheckinError, CheckinResult};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::debug;

/// Redis fixed-window counter shared by every process using the same server
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisRateLimiter {
    pub fn new<S: Into<String>>(conn: ConnectionManager, key_prefix: S) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            format!("ratelimit:{key}")
        } else {
            format!("{}:ratelimit:{}", self.key_prefix, key)
        }
    }

    /// `SET NX EX` and `INCR` in one MULTI, so a counter never exists without a TTL
    fn counter_pipeline(full_key: &str, window: Duration) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(full_key)
            .arg(0)
            .arg("EX")
            .arg(window.as_secs().max(1))
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(full_key);
        pipe
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(&self, key: &str, limit: u32, window: Duration) -> CheckinResult<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        let (count,): (u64,) = Self::counter_pipeline(&full_key, window)
            .query_async(&mut conn)
            .await
            .map_err(|e| CheckinError::CacheError(e.to_string()))?;

        debug!(key = %full_key, count, limit, "Rate limit counter");
        Ok(count <= u64::from(limit))
    }
}

/// Tracked keys above which expired windows are swept on the next call
const DEFAULT_SWEEP_THRESHOLD: usize = 1024;

struct Window {
    started_at: Instant,
    length: Duration,
    count: u32,
}

impl Window {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= self.length
    }
}

/// Process-local limiter
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    sweep_threshold: usize,
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::with_sweep_threshold(DEFAULT_SWEEP_THRESHOLD)
    }
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            sweep_threshold: sweep_threshold.max(1),
        }
    }

    /// Number of keys currently holding a window
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn try_acquire(&self, key: &str, limit: u32, window: Duration) -> CheckinResult<bool> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        if windows.len() >= self.sweep_threshold && !windows.contains_key(key) {
            let before = windows.len();
            windows.retain(|_, w| !w.expired(now));
            debug!(removed = before - windows.len(), "Swept expired rate limit windows");
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            length: window,
            count: 0,
        });

        if entry.expired(now) {
            entry.started_at = now;
            entry.count = 0;
        }
        entry.length = window;

        if entry.count >= limit {
            return Ok(false);
        }
        entry.count += 1;
        Ok(true)
    }
}
