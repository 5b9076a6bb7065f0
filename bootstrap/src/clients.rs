//! 依赖客户端
//!
//! 每个客户端在首次使用时创建，创建成功后不再重复；
//! 创建失败作为可重试的依赖错误返回给调用阶段

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_adapter_nats::{NatsClient, NatsConfig};
use keel_adapter_postgres::{PostgresClient, PostgresConfig};
use keel_adapter_pulsar::{PulsarClient, PulsarConfig};
use keel_adapter_redis::RedisClient;
use keel_common::CircuitBreakerConfig;
use keel_config::{BootstrapConfig, NatsSettings, PostgresSettings, PulsarSettings, RedisSettings};
use keel_errors::{AppError, AppResult};
use keel_ports::{CacheStore, SchemaStore, StreamAdmin, TopicAdmin};
use secrecy::ExposeSecret;
use tokio::sync::OnceCell;
use tracing::info;

/// 阶段获取客户端的入口
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn schema_store(&self) -> AppResult<Arc<dyn SchemaStore>>;

    async fn cache_store(&self) -> AppResult<Arc<dyn CacheStore>>;

    async fn stream_admin(&self) -> AppResult<Arc<dyn StreamAdmin>>;

    async fn topic_admin(&self) -> AppResult<Arc<dyn TopicAdmin>>;
}

/// 按需创建的客户端集合
pub struct LazyClients {
    postgres_settings: Option<PostgresSettings>,
    redis_settings: Option<RedisSettings>,
    nats_settings: Option<NatsSettings>,
    pulsar_settings: Option<PulsarSettings>,
    breaker: CircuitBreakerConfig,
    postgres: OnceCell<Arc<PostgresClient>>,
    redis: OnceCell<Arc<RedisClient>>,
    nats: OnceCell<Arc<NatsClient>>,
    pulsar: OnceCell<Arc<PulsarClient>>,
}

impl LazyClients {
    pub fn new(config: &BootstrapConfig) -> Self {
        Self {
            postgres_settings: config.postgres.clone(),
            redis_settings: config.redis.clone(),
            nats_settings: config.nats.clone(),
            pulsar_settings: config.pulsar.clone(),
            breaker: config.circuit_breaker.to_breaker_config(),
            postgres: OnceCell::new(),
            redis: OnceCell::new(),
            nats: OnceCell::new(),
            pulsar: OnceCell::new(),
        }
    }

    async fn postgres(&self) -> AppResult<Arc<PostgresClient>> {
        self.postgres
            .get_or_try_init(|| async {
                let settings = required(&self.postgres_settings, "postgres")?;
                let config = PostgresConfig::new(settings.url.expose_secret().as_str())
                    .with_max_connections(settings.max_connections)
                    .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
                let client = PostgresClient::connect(&config, self.breaker.clone()).await?;
                Ok(Arc::new(client))
            })
            .await
            .cloned()
    }

    async fn redis(&self) -> AppResult<Arc<RedisClient>> {
        self.redis
            .get_or_try_init(|| async {
                let settings = required(&self.redis_settings, "redis")?;
                let client = RedisClient::connect(
                    settings.url.expose_secret(),
                    Duration::from_secs(settings.connect_timeout_secs),
                    self.breaker.clone(),
                )
                .await?;
                Ok(Arc::new(client))
            })
            .await
            .cloned()
    }

    async fn nats(&self) -> AppResult<Arc<NatsClient>> {
        self.nats
            .get_or_try_init(|| async {
                let settings = required(&self.nats_settings, "nats")?;
                let mut config = NatsConfig::new(settings.url.as_str())
                    .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs));
                if let Some(token) = &settings.token {
                    config = config.with_token(token.expose_secret().as_str());
                }
                let client = NatsClient::connect(&config, self.breaker.clone()).await?;
                Ok(Arc::new(client))
            })
            .await
            .cloned()
    }

    async fn pulsar(&self) -> AppResult<Arc<PulsarClient>> {
        self.pulsar
            .get_or_try_init(|| async {
                let settings = required(&self.pulsar_settings, "pulsar")?;
                let mut config = PulsarConfig::new(settings.url.as_str())
                    .with_namespace(settings.tenant.as_str(), settings.namespace.as_str())
                    .with_operation_timeout(Duration::from_secs(settings.operation_timeout_secs));
                if let Some(admin_url) = &settings.admin_url {
                    config = config.with_admin_url(admin_url.as_str());
                }
                if let Some(token) = &settings.token {
                    config = config.with_token(token.expose_secret().as_str());
                }
                let client = PulsarClient::connect(config, self.breaker.clone()).await?;
                Ok(Arc::new(client))
            })
            .await
            .cloned()
    }

    /// 释放已创建的连接
    pub async fn close(&self) {
        if let Some(postgres) = self.postgres.get() {
            postgres.close().await;
        }
        if let Some(nats) = self.nats.get() {
            nats.close().await;
        }
        info!("Dependency clients closed");
    }
}

fn required<'a, T>(settings: &'a Option<T>, dependency: &str) -> AppResult<&'a T> {
    settings
        .as_ref()
        .ok_or_else(|| AppError::config(format!("{dependency} is not configured")))
}

#[async_trait]
impl ClientProvider for LazyClients {
    async fn schema_store(&self) -> AppResult<Arc<dyn SchemaStore>> {
        Ok(self.postgres().await?)
    }

    async fn cache_store(&self) -> AppResult<Arc<dyn CacheStore>> {
        Ok(self.redis().await?)
    }

    async fn stream_admin(&self) -> AppResult<Arc<dyn StreamAdmin>> {
        Ok(self.nats().await?)
    }

    async fn topic_admin(&self) -> AppResult<Arc<dyn TopicAdmin>> {
        Ok(self.pulsar().await?)
    }
}
