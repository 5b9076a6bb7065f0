//! PostgreSQL 连接管理

use keel_errors::{AppError, AppResult};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// PostgreSQL 连接池配置
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
            min_connections: 0,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout)
    }
}

/// 创建 PostgreSQL 连接池（立即建立第一个连接）
pub async fn create_pool(config: &PostgresConfig) -> AppResult<PgPool> {
    config
        .pool_options()
        .connect(&config.url)
        .await
        .map_err(|e| AppError::dependency("postgres", "connect", e))
}

/// 创建延迟连接的连接池，首次查询时才建立连接
pub fn create_lazy_pool(config: &PostgresConfig) -> AppResult<PgPool> {
    config
        .pool_options()
        .connect_lazy(&config.url)
        .map_err(|e| AppError::dependency("postgres", "connect", e))
}

/// 检查数据库连接
pub async fn check_connection(pool: &PgPool) -> AppResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| AppError::dependency("postgres", "ping", e))?;
    Ok(())
}
