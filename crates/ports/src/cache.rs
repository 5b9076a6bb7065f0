//! Cache trait 定义

use async_trait::async_trait;
use keel_errors::AppResult;
use std::time::Duration;

/// 缓存存储
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 连通性检查
    async fn ping(&self) -> AppResult<()>;

    /// 设置缓存值
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// 获取缓存值
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
}
