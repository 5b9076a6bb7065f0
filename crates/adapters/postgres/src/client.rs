//! PostgreSQL 客户端
//!
//! 持有一个连接池和一个断路器，所有查询都经过断路器

use async_trait::async_trait;
use keel_common::{CircuitBreaker, CircuitBreakerConfig};
use keel_errors::{AppError, AppResult};
use keel_ports::SchemaStore;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::connection::{PostgresConfig, check_connection, create_pool};

pub struct PostgresClient {
    pool: PgPool,
    breaker: CircuitBreaker,
}

impl PostgresClient {
    /// 建立连接池
    pub async fn connect(
        config: &PostgresConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let pool = create_pool(config).await?;
        info!(
            max_connections = config.max_connections,
            "PostgreSQL pool created"
        );
        Ok(Self::from_pool(pool, breaker_config))
    }

    pub fn from_pool(pool: PgPool, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            pool,
            breaker: CircuitBreaker::new("postgres", breaker_config),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 关闭连接池，等待借出的连接归还
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("PostgreSQL pool closed");
    }

    async fn schema_exists(&self, schema: &str) -> AppResult<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::dependency("postgres", "validate_schema", e))?;
        Ok(row.0)
    }
}

#[async_trait]
impl SchemaStore for PostgresClient {
    async fn validate_schema(&self, schema: &str) -> AppResult<()> {
        // 查询失败计入断路器，schema 缺失不计入
        let exists = self.breaker.call(|| self.schema_exists(schema)).await?;
        if !exists {
            return Err(AppError::dependency(
                "postgres",
                "validate_schema",
                format!("schema \"{schema}\" does not exist"),
            ));
        }
        debug!(schema = %schema, "Database schema validated");
        Ok(())
    }

    async fn ping(&self) -> AppResult<()> {
        self.breaker.call(|| check_connection(&self.pool)).await
    }
}
