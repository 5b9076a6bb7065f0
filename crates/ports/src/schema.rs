//! Schema trait 定义

use async_trait::async_trait;
use keel_errors::AppResult;

/// 关系型存储的只读 schema 校验
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// 确认 schema 存在，不存在时返回错误
    async fn validate_schema(&self, schema: &str) -> AppResult<()>;

    async fn ping(&self) -> AppResult<()>;
}
