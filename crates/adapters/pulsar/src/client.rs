//! Pulsar 客户端
//!
//! `create_topic`：分区 topic 先通过 admin API 创建，再建立并关闭一个
//! producer 确认 topic 可用（非分区 topic 依赖 broker 自动创建）

use async_trait::async_trait;
use keel_common::{CircuitBreaker, CircuitBreakerConfig, TopicConfig};
use keel_errors::{AppError, AppResult};
use keel_ports::TopicAdmin;
use pulsar::{Pulsar, TokioExecutor};
use tracing::{debug, info};

use crate::admin::{PartitionedTopicOutcome, PulsarAdmin};
use crate::connection::{PulsarConfig, connect};

pub struct PulsarClient {
    pulsar: Pulsar<TokioExecutor>,
    admin: Option<PulsarAdmin>,
    config: PulsarConfig,
    breaker: CircuitBreaker,
}

impl PulsarClient {
    pub async fn connect(
        config: PulsarConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let pulsar = connect(&config).await?;
        let admin = config
            .admin_url
            .as_deref()
            .map(|url| PulsarAdmin::new(url, config.token.clone(), config.operation_timeout))
            .transpose()?;
        info!(url = %config.url, "Pulsar connection established");
        Ok(Self {
            pulsar,
            admin,
            config,
            breaker: CircuitBreaker::new("pulsar", breaker_config),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn ensure_topic(&self, topic: &TopicConfig) -> AppResult<()> {
        let qualified = self.config.qualified_topic(&topic.name);

        if topic.is_partitioned() {
            let admin = self.admin.as_ref().ok_or_else(|| {
                AppError::dependency(
                    "pulsar",
                    "create_topic",
                    format!("admin_url required for partitioned topic {qualified}"),
                )
            })?;
            let outcome = admin
                .create_partitioned_topic(&qualified, topic.partitions)
                .await?;
            if outcome == PartitionedTopicOutcome::AlreadyExists {
                debug!(topic = %qualified, "Partitioned topic already exists");
            }
        }

        let mut producer = self
            .pulsar
            .producer()
            .with_topic(qualified.as_str())
            .build()
            .await
            .map_err(|e| AppError::dependency("pulsar", "create_topic", e))?;
        producer
            .close()
            .await
            .map_err(|e| AppError::dependency("pulsar", "create_topic", e))?;

        info!(topic = %qualified, partitions = topic.partitions, "Pulsar topic ready");
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for PulsarClient {
    async fn create_topic(&self, config: &TopicConfig) -> AppResult<()> {
        self.breaker.call(|| self.ensure_topic(config)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // 需要 Pulsar 实例
    async fn test_create_topic_is_idempotent() {
        let config =
            PulsarConfig::new("pulsar://127.0.0.1:6650").with_admin_url("http://127.0.0.1:8080");
        let client = PulsarClient::connect(config, CircuitBreakerConfig::default())
            .await
            .unwrap();

        let plain = TopicConfig::new("keel-test-plain", 0);
        client.create_topic(&plain).await.unwrap();
        client.create_topic(&plain).await.unwrap();

        let partitioned = TopicConfig::new("keel-test-partitioned", 2);
        client.create_topic(&partitioned).await.unwrap();
        client.create_topic(&partitioned).await.unwrap();
    }
}
