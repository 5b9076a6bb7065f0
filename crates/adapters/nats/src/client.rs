//! JetStream 客户端
//!
//! 流的创建是幂等的：先创建，已存在时按声明的配置更新

use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use keel_common::{CircuitBreaker, CircuitBreakerConfig, RetentionPolicy, StreamConfig};
use keel_errors::{AppError, AppResult};
use keel_ports::StreamAdmin;
use tracing::{debug, info};

use crate::connection::{NatsConfig, connect};

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    breaker: CircuitBreaker,
}

impl NatsClient {
    pub async fn connect(
        config: &NatsConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let client = connect(config).await?;
        info!(url = %config.url, "NATS connection established");
        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            breaker: CircuitBreaker::new("nats", breaker_config),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 刷新未发送的消息
    pub async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "NATS flush on close failed");
        }
    }

    async fn create_or_update(&self, config: stream::Config) -> AppResult<()> {
        match self.jetstream.create_stream(config.clone()).await {
            Ok(_) => {
                info!(stream = %config.name, "JetStream stream created");
                Ok(())
            }
            Err(create_err) => {
                debug!(
                    stream = %config.name,
                    error = %create_err,
                    "Create stream failed, trying update"
                );
                self.jetstream
                    .update_stream(&config)
                    .await
                    .map_err(|update_err| {
                        AppError::dependency(
                            "nats",
                            "create_stream",
                            format!(
                                "stream {}: create: {create_err}; update: {update_err}",
                                config.name
                            ),
                        )
                    })?;
                info!(stream = %config.name, "JetStream stream updated");
                Ok(())
            }
        }
    }
}

/// 声明式配置转换为 JetStream 配置
pub fn stream_config(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        max_age: config.max_age(),
        num_replicas: config.replicas.max(1),
        ..Default::default()
    }
}

#[async_trait]
impl StreamAdmin for NatsClient {
    async fn create_stream(&self, config: &StreamConfig) -> AppResult<()> {
        let js_config = stream_config(config);
        self.breaker.call(|| self.create_or_update(js_config)).await
    }
}
