use std::time::Duration;

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// 旁路缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 关闭时所有读取直接访问数据库
    pub enabled: bool,
    pub redis_url: String,
    /// 所有键的命名空间前缀
    pub key_prefix: String,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "checkin".to_string(),
            ttl_seconds: 1800,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl ConfigValidator for CacheConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_url(&self.redis_url, &["redis", "rediss"], "cache.redis_url")?;
        if self.ttl_seconds == 0 || self.ttl_seconds > 86_400 {
            return Err(ConfigError::Validation(
                "cache.ttl_seconds must be between 1 and 86400".to_string(),
            ));
        }
        Ok(())
    }
}

/// 签到和补签申请的固定窗口限流
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// 每个 (用户, 任务) 每个窗口的签到尝试次数
    pub checkin_attempts: u32,
    /// 每个用户每个窗口的补签申请数
    pub audit_requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            checkin_attempts: 10,
            audit_requests: 5,
            window_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl ConfigValidator for RateLimitConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_count(self.checkin_attempts as usize, "rate_limit.checkin_attempts")?;
        ValidationUtils::validate_count(self.audit_requests as usize, "rate_limit.audit_requests")?;
        ValidationUtils::validate_timeout_seconds(self.window_seconds, "rate_limit.window_seconds")?;
        Ok(())
    }
}
