pub mod audit_workflow;
pub mod checkin;
pub mod task_lifecycle;

pub use audit_workflow::*;
pub use checkin::*;
pub use task_lifecycle::*;

use std::sync::Arc;
use std::time::Duration;

use checkin_domain::{Clock, Database, RateLimiter, SystemClock, Task, VerificationEngine};
use checkin_errors::{CheckinError, CheckinResult};
use checkin_infrastructure::CacheConsistencyLayer;
use tracing::warn;

/// 限流配额
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// 每个 (用户, 任务) 在一个窗口内允许的签到尝试次数
    pub checkin_attempts: u32,
    /// 每个用户在一个窗口内允许提交的补签申请数
    pub audit_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            checkin_attempts: 10,
            audit_requests: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// 可选的限流器；后端故障时放行
#[derive(Clone, Default)]
pub struct RateLimitGuard {
    limiter: Option<Arc<dyn RateLimiter>>,
    policy: RateLimitPolicy,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<dyn RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter: Some(limiter),
            policy,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn check_checkin(&self, user_id: i64, task_id: i64) -> CheckinResult<()> {
        self.check(
            format!("checkin:{user_id}:{task_id}"),
            self.policy.checkin_attempts,
        )
        .await
    }

    pub async fn check_audit_request(&self, user_id: i64) -> CheckinResult<()> {
        self.check(format!("audit:{user_id}"), self.policy.audit_requests)
            .await
    }

    async fn check(&self, key: String, limit: u32) -> CheckinResult<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        match limiter.try_acquire(&key, limit, self.policy.window).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CheckinError::RateLimited { key }),
            Err(e) => {
                warn!(key, error = %e, "限流器不可用，放行请求");
                Ok(())
            }
        }
    }
}

/// 已提交的写操作结果与提交后需要删除的缓存键
///
/// 写操作分两段：事务提交（受超时约束）和缓存失效（提交后总会执行）。
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub stale_keys: Vec<String>,
}

impl<T> Committed<T> {
    pub fn new(value: T, stale_keys: Vec<String>) -> Self {
        Self { value, stale_keys }
    }

    /// 删除失效的缓存键并取出结果；缓存故障不会让已提交的操作失败
    pub async fn settle(self, cache: &CacheConsistencyLayer) -> T {
        cache.invalidate(self.stale_keys).await;
        self.value
    }
}

/// 各服务共享的协作方
#[derive(Clone)]
pub struct ServiceDeps {
    pub db: Arc<dyn Database>,
    pub cache: CacheConsistencyLayer,
    pub clock: Arc<dyn Clock>,
    pub rate_limit: RateLimitGuard,
    pub verification: VerificationEngine,
}

impl ServiceDeps {
    pub fn new(db: Arc<dyn Database>, cache: CacheConsistencyLayer) -> Self {
        Self {
            db,
            cache,
            clock: Arc::new(SystemClock),
            rate_limit: RateLimitGuard::disabled(),
            verification: VerificationEngine::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>, policy: RateLimitPolicy) -> Self {
        self.rate_limit = RateLimitGuard::new(limiter, policy);
        self
    }

    pub fn with_verification(mut self, verification: VerificationEngine) -> Self {
        self.verification = verification;
        self
    }

    /// 经缓存读取任务
    pub(crate) async fn cached_task(&self, task_id: i64) -> CheckinResult<Task> {
        let db = &self.db;
        self.cache
            .get_or_load(&self.cache.keys().task(task_id), || async move {
                db.get_task(task_id).await
            })
            .await?
            .ok_or_else(|| CheckinError::task_not_found(task_id))
    }
}
