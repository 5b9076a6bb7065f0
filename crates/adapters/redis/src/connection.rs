//! Redis 连接管理

use std::time::Duration;

use keel_errors::{AppError, AppResult};
use redis::Client;
use redis::aio::ConnectionManager;

/// 创建 Redis 连接管理器
///
/// 连接管理器断线后自动重连；首次连接受 `connect_timeout` 限制
pub async fn create_connection_manager(
    url: &str,
    connect_timeout: Duration,
) -> AppResult<ConnectionManager> {
    let client = Client::open(url).map_err(|e| AppError::dependency("redis", "connect", e))?;

    tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            AppError::dependency(
                "redis",
                "connect",
                format!("timed out after {}ms", connect_timeout.as_millis()),
            )
        })?
        .map_err(|e| AppError::dependency("redis", "connect", e))
}

/// 检查 Redis 连接
pub async fn check_connection(conn: &mut ConnectionManager) -> AppResult<()> {
    redis::cmd("PING")
        .query_async::<String>(conn)
        .await
        .map_err(|e| AppError::dependency("redis", "ping", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_dependency_error() {
        let err = create_connection_manager("not-a-redis-url", Duration::from_secs(1))
            .await
            .err()
            .expect("expected connection error");
        assert!(matches!(err, AppError::Dependency { .. }));
        assert!(err.to_string().starts_with("redis connect failed"));
    }
}
