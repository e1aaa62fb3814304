use std::sync::Arc;

use anyhow::{Context, Result};
use checkin_application::{CheckinCore, RateLimitPolicy, ServiceDeps};
use checkin_config::AppConfig;
use checkin_domain::{CacheStore, RateLimiter};
use checkin_infrastructure::{
    CacheConsistencyLayer, CacheKeys, DatabaseManager, InMemoryRateLimiter, RedisCacheManager,
    RedisRateLimiter,
};
use tracing::{info, warn};

/// 按配置组装好的签到核心及其后端
pub struct Application {
    database: DatabaseManager,
    cache: Option<Arc<RedisCacheManager>>,
    core: CheckinCore,
}

/// 后端健康状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub database: bool,
    /// 未启用缓存时为 `None`
    pub cache: Option<bool>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database && self.cache.unwrap_or(true)
    }
}

impl Application {
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let database = Self::connect_database(config).await?;
        database.migrate().await.context("数据库迁移失败")?;

        let cache = if config.cache.enabled {
            let manager = RedisCacheManager::new(&config.cache.redis_url)
                .await
                .with_context(|| format!("连接Redis失败: {}", config.cache.redis_url))?;
            info!("缓存已启用: {}", config.cache.redis_url);
            Some(Arc::new(manager))
        } else {
            info!("缓存未启用，所有读取直接访问数据库");
            None
        };

        let cache_layer = match &cache {
            Some(manager) => CacheConsistencyLayer::new(
                Arc::clone(manager) as Arc<dyn CacheStore>,
                CacheKeys::new(config.cache.key_prefix.clone()),
                config.cache.ttl(),
            ),
            None => CacheConsistencyLayer::disabled(),
        };

        let mut deps = ServiceDeps::new(database.store(), cache_layer);
        if config.rate_limit.enabled {
            let limiter: Arc<dyn RateLimiter> = match &cache {
                Some(manager) => Arc::new(RedisRateLimiter::new(
                    manager.connection(),
                    config.cache.key_prefix.clone(),
                )),
                None => {
                    warn!("限流使用进程内计数器，多实例部署时不共享");
                    Arc::new(InMemoryRateLimiter::new())
                }
            };
            deps = deps.with_rate_limiter(
                limiter,
                RateLimitPolicy {
                    checkin_attempts: config.rate_limit.checkin_attempts,
                    audit_requests: config.rate_limit.audit_requests,
                    window: config.rate_limit.window(),
                },
            );
        }

        let core = CheckinCore::with_timeout(deps, config.service.operation_timeout());
        Ok(Self {
            database,
            cache,
            core,
        })
    }

    async fn connect_database(config: &AppConfig) -> Result<DatabaseManager> {
        let manager = if config.database.is_in_memory() {
            DatabaseManager::in_memory().await
        } else {
            DatabaseManager::new(&config.database.url, config.database.max_connections).await
        };
        manager.with_context(|| format!("连接数据库失败: {}", config.database.url))
    }

    pub fn core(&self) -> &CheckinCore {
        &self.core
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub async fn health_check(&self) -> HealthReport {
        let database = match self.database.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("数据库健康检查失败: {e}");
                false
            }
        };
        let cache = match &self.cache {
            Some(manager) => Some(manager.health_check().await.unwrap_or_else(|e| {
                warn!("缓存健康检查失败: {e}");
                false
            })),
            None => None,
        };
        HealthReport { database, cache }
    }

    pub async fn shutdown(&self) {
        self.database.close().await;
        info!("数据库连接已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkin_application::{CheckinRequest, TaskDraft};
    use checkin_config::DatabaseConfig;
    use checkin_domain::{RecordQuery, VerificationPayload, VerificationPolicy};

    fn memory_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_in_memory_application() -> Result<()> {
        let app = Application::build(&memory_config()).await?;
        let report = app.health_check().await;
        assert!(report.is_healthy());
        assert_eq!(report.cache, None);

        let group_id: i64 = sqlx::query_scalar(
            "INSERT INTO groups (name, description, creator_id, creator_username, created_at) \
             VALUES ('研发部', '', 1, 'owner', 0) RETURNING id",
        )
        .fetch_one(app.database().pool())
        .await?;

        let now = chrono::Utc::now();
        let view = app
            .core()
            .create_task(
                group_id,
                TaskDraft {
                    name: "站会".to_string(),
                    description: String::new(),
                    start_time: now - chrono::Duration::minutes(1),
                    end_time: now + chrono::Duration::hours(1),
                    policy: VerificationPolicy::default(),
                },
            )
            .await?;
        app.core()
            .check_in(CheckinRequest {
                task_id: view.task.id,
                user_id: 2,
                username: "bob".to_string(),
                group_id,
                payload: VerificationPayload::default(),
            })
            .await?;
        let records = app
            .core()
            .list_checkin_records(RecordQuery::ByTask(view.task.id))
            .await?;
        assert_eq!(records.len(), 1);

        app.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limit_without_cache_uses_local_counter() -> Result<()> {
        let mut config = memory_config();
        config.rate_limit.enabled = true;
        config.rate_limit.audit_requests = 1;
        let app = Application::build(&config).await?;
        assert!(app.health_check().await.is_healthy());
        Ok(())
    }
}
