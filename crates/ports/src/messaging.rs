//! 消息中间件资源管理 trait

use async_trait::async_trait;
use keel_common::{StreamConfig, TopicConfig};
use keel_errors::AppResult;

/// JetStream 流管理
#[async_trait]
pub trait StreamAdmin: Send + Sync {
    /// 创建流；已存在时按配置更新。重复调用不报错
    async fn create_stream(&self, config: &StreamConfig) -> AppResult<()>;
}

/// 主题管理
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// 创建主题（partitions > 0 时为分区主题）。重复调用不报错
    async fn create_topic(&self, config: &TopicConfig) -> AppResult<()>;
}
