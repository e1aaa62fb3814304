use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    cache::{CacheConfig, RateLimitConfig},
    database::DatabaseConfig,
    logging::ObservabilityConfig,
};
use crate::validation::{ConfigValidator, ValidationUtils};

/// 服务层通用参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 单次核心操作的超时时间
    pub operation_timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            operation_timeout_seconds: 10,
        }
    }
}

impl ServiceConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }
}

impl ConfigValidator for ServiceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.operation_timeout_seconds,
            "service.operation_timeout_seconds",
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub service: ServiceConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：内置默认值 → TOML文件 → `CHECKIN_` 环境变量
    ///
    /// 环境变量用双下划线分隔层级，例如 `CHECKIN_DATABASE__URL`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", defaults.database.url.clone())?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("cache.enabled", defaults.cache.enabled)?
            .set_default("cache.redis_url", defaults.cache.redis_url.clone())?
            .set_default("cache.key_prefix", defaults.cache.key_prefix.clone())?
            .set_default("cache.ttl_seconds", defaults.cache.ttl_seconds)?
            .set_default("rate_limit.enabled", defaults.rate_limit.enabled)?
            .set_default("rate_limit.checkin_attempts", defaults.rate_limit.checkin_attempts)?
            .set_default("rate_limit.audit_requests", defaults.rate_limit.audit_requests)?
            .set_default("rate_limit.window_seconds", defaults.rate_limit.window_seconds)?
            .set_default(
                "service.operation_timeout_seconds",
                defaults.service.operation_timeout_seconds,
            )?
            .set_default("observability.log_level", defaults.observability.log_level.to_string())?
            .set_default("observability.log_format", defaults.observability.log_format.to_string())?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/checkin.toml", "checkin.toml", "/etc/checkin/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CHECKIN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置验证失败")?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置验证失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        self.service.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
