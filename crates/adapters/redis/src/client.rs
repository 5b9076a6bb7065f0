//! Redis 客户端

use std::time::Duration;

use async_trait::async_trait;
use keel_common::{CircuitBreaker, CircuitBreakerConfig};
use keel_errors::{AppError, AppResult};
use keel_ports::CacheStore;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::connection::{check_connection, create_connection_manager};

/// Redis 客户端，持有一个连接管理器和一个断路器
pub struct RedisClient {
    conn: ConnectionManager,
    breaker: CircuitBreaker,
}

impl RedisClient {
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let conn = create_connection_manager(url, connect_timeout).await?;
        info!("Redis connection established");
        Ok(Self {
            conn,
            breaker: CircuitBreaker::new("redis", breaker_config),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn do_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(duration) => conn
                .set_ex(key, value, duration.as_secs().max(1))
                .await
                .map_err(|e| AppError::dependency("redis", "set", e)),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| AppError::dependency("redis", "set", e)),
        }
    }

    async fn do_get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| AppError::dependency("redis", "get", e))
    }
}

#[async_trait]
impl CacheStore for RedisClient {
    async fn ping(&self) -> AppResult<()> {
        self.breaker
            .call(|| async {
                let mut conn = self.conn.clone();
                check_connection(&mut conn).await
            })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.breaker.call(|| self.do_set(key, value, ttl)).await
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.breaker.call(|| self.do_get(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::CircuitState;

    #[tokio::test]
    #[ignore] // 需要 Redis 实例
    async fn test_ping_set_get() {
        let client = RedisClient::connect(
            "redis://127.0.0.1:6379",
            Duration::from_secs(5),
            CircuitBreakerConfig::default(),
        )
        .await
        .unwrap();

        client.ping().await.unwrap();
        client
            .set("keel:test:warm", "ok", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(
            client.get("keel:test:warm").await.unwrap().as_deref(),
            Some("ok")
        );
        assert_eq!(client.get("keel:test:missing").await.unwrap(), None);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }
}
