pub mod cache;
pub mod database;
pub mod error_handling;
pub mod rate_limit;

pub use cache::{
    CacheConsistencyLayer, CacheKeys, CacheStats, CacheStoreExt, InMemoryCache,
    RedisCacheManager, DEFAULT_CACHE_TTL,
};
pub use database::{DatabaseManager, SqliteStore, SqliteTransaction};
pub use rate_limit::{InMemoryRateLimiter, RedisRateLimiter};
