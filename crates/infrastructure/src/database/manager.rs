use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use checkin_errors::{CheckinError, CheckinResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::migrations::run_migrations;
use super::sqlite::SqliteStore;

/// 等待其他写事务释放写锁的最长时间
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the connection pool and hands out store handles
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 连接文件或内存数据库，自动创建缺失的数据库文件
    pub async fn new(url: &str, max_connections: u32) -> CheckinResult<Self> {
        debug!("Connecting to SQLite database at: {}", url);

        let connect_options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CheckinError::config_error(format!("无效的数据库地址 {url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| CheckinError::persistence("连接数据库", e))?;

        info!(url, max_connections, "Database pool created");
        Ok(Self { pool })
    }

    /// 单连接的内存数据库，连接不会被回收
    pub async fn in_memory() -> CheckinResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CheckinError::config_error(format!("无效的数据库地址: {e}")))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .map_err(|e| CheckinError::persistence("连接数据库", e))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> CheckinResult<()> {
        run_migrations(&self.pool).await
    }

    pub async fn health_check(&self) -> CheckinResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckinError::persistence("健康检查", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::new(self.pool.clone()))
    }
}
