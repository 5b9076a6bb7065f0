//! 启动阶段
//!
//! 每个阶段互相独立，由编排器分别重试

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::FutureExt;
use futures::StreamExt;
use futures::stream;
use keel_common::{StreamConfig, TopicConfig};
use keel_config::BootstrapConfig;
use keel_errors::{AppError, AppResult};
use keel_ports::{CacheStore, SchemaStore, StreamAdmin, TopicAdmin};
use tracing::{debug, info, warn};

use crate::clients::ClientProvider;

/// 每个阶段内同时创建的资源上限
pub const MAX_CONCURRENT_CREATES: usize = 5;

const WARM_VALUE: &str = "warm";
const WARM_TTL: Duration = Duration::from_secs(60);

/// 启动阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    InitializeNats,
    InitializePulsar,
    ValidateDatabase,
    WarmCache,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::InitializeNats,
        Phase::InitializePulsar,
        Phase::ValidateDatabase,
        Phase::WarmCache,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::InitializeNats => "initialize_nats",
            Phase::InitializePulsar => "initialize_pulsar",
            Phase::ValidateDatabase => "validate_database",
            Phase::WarmCache => "warm_cache",
        }
    }

    /// 阶段依赖的组件是否已配置
    pub fn is_configured(&self, config: &BootstrapConfig) -> bool {
        match self {
            Phase::InitializeNats => config.nats.is_some(),
            Phase::InitializePulsar => config.pulsar.is_some(),
            Phase::ValidateDatabase => config.postgres.is_some(),
            Phase::WarmCache => config.redis.is_some(),
        }
    }

    /// 已配置的阶段
    pub fn configured(config: &BootstrapConfig) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|phase| {
                let configured = phase.is_configured(config);
                if !configured {
                    info!(phase = %phase, "Phase skipped, dependency not configured");
                }
                configured
            })
            .collect()
    }

    /// 执行一次阶段，客户端创建失败同样作为本次尝试的错误
    pub async fn execute(
        &self,
        clients: &dyn ClientProvider,
        config: &BootstrapConfig,
    ) -> AppResult<()> {
        match self {
            Phase::InitializeNats => {
                let streams = config
                    .nats
                    .as_ref()
                    .map(|n| n.streams.as_slice())
                    .unwrap_or_default();
                let admin = clients.stream_admin().await?;
                initialize_nats(admin.as_ref(), streams).await
            }
            Phase::InitializePulsar => {
                let topics = config
                    .pulsar
                    .as_ref()
                    .map(|p| p.topics.as_slice())
                    .unwrap_or_default();
                let admin = clients.topic_admin().await?;
                initialize_pulsar(admin.as_ref(), topics).await
            }
            Phase::ValidateDatabase => {
                let schema = config
                    .postgres
                    .as_ref()
                    .map(|p| p.schema.as_str())
                    .unwrap_or("public");
                let store = clients.schema_store().await?;
                validate_database(store.as_ref(), schema).await
            }
            Phase::WarmCache => {
                let warm_key = config.redis.as_ref().and_then(|r| r.warm_key.as_deref());
                let cache = clients.cache_store().await?;
                warm_cache(cache.as_ref(), warm_key).await
            }
        }
    }
}

/// 创建所有声明的 JetStream 流
pub async fn initialize_nats(admin: &dyn StreamAdmin, streams: &[StreamConfig]) -> AppResult<()> {
    create_all("nats", "create_stream", streams, |s| s.name.as_str(), |s| {
        admin.create_stream(s)
    })
    .await?;
    info!(count = streams.len(), "JetStream streams initialized");
    Ok(())
}

/// 创建所有声明的 Pulsar topic
pub async fn initialize_pulsar(admin: &dyn TopicAdmin, topics: &[TopicConfig]) -> AppResult<()> {
    create_all("pulsar", "create_topic", topics, |t| t.name.as_str(), |t| {
        admin.create_topic(t)
    })
    .await?;
    info!(count = topics.len(), "Pulsar topics initialized");
    Ok(())
}

/// 只读校验 schema 存在
pub async fn validate_database(store: &dyn SchemaStore, schema: &str) -> AppResult<()> {
    store.validate_schema(schema).await?;
    info!(schema = %schema, "Database schema validated");
    Ok(())
}

/// 缓存预热：连通性检查，配置了哨兵键时再写入并读回
pub async fn warm_cache(cache: &dyn CacheStore, warm_key: Option<&str>) -> AppResult<()> {
    cache.ping().await?;

    if let Some(key) = warm_key {
        cache.set(key, WARM_VALUE, Some(WARM_TTL)).await?;
        let value = cache.get(key).await?;
        if value.as_deref() != Some(WARM_VALUE) {
            return Err(AppError::dependency(
                "redis",
                "warm_cache",
                format!("sentinel key {key} read back {value:?}"),
            ));
        }
        debug!(key = %key, "Cache sentinel written and read back");
    }

    info!("Cache warmed");
    Ok(())
}

/// 以有限并发创建一组资源
///
/// 单个资源失败不影响其他资源，全部完成后汇总失败项
async fn create_all<'a, T, N, F, Fut>(
    dependency: &str,
    operation: &str,
    items: &'a [T],
    name: N,
    create: F,
) -> AppResult<()>
where
    T: Sync,
    N: Fn(&'a T) -> &'a str + Sync,
    F: Fn(&'a T) -> Fut + Sync,
    Fut: Future<Output = AppResult<()>> + Send + 'a,
{
    let mut failures: Vec<String> = stream::iter(items)
        .map(|item| {
            let attempt = create(item);
            let item_name = name(item);
            async move {
                match attempt.await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(dependency, resource = %item_name, error = %e, "Resource creation failed");
                        Some(format!("{item_name}: {e}"))
                    }
                }
            }
        })
        .buffer_unordered(MAX_CONCURRENT_CREATES)
        .filter_map(|failure| async move { failure })
        .collect::<Vec<String>>()
        .boxed()
        .await;

    if failures.is_empty() {
        return Ok(());
    }

    failures.sort();
    Err(AppError::dependency(
        dependency,
        operation,
        format!(
            "{} of {} failed: {}",
            failures.len(),
            items.len(),
            failures.join("; ")
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeCache {
        values: Mutex<std::collections::HashMap<String, String>>,
        drop_writes: bool,
    }

    #[async_trait]
    impl CacheStore for FakeCache {
        async fn ping(&self) -> AppResult<()> {
            Ok(())
        }

        async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> AppResult<()> {
            if !self.drop_writes {
                self.values.lock().insert(key.to_string(), value.to_string());
            }
            Ok(())
        }

        async fn get(&self, key: &str) -> AppResult<Option<String>> {
            Ok(self.values.lock().get(key).cloned())
        }
    }

    #[test]
    fn test_phase_names() {
        let names: Vec<String> = Phase::ALL.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            names,
            ["initialize_nats", "initialize_pulsar", "validate_database", "warm_cache"]
        );
        assert!(Phase::ALL.iter().all(|p| p.name() == p.to_string()));
    }

    #[test]
    fn test_unconfigured_phases_are_skipped() {
        assert!(Phase::configured(&BootstrapConfig::default()).is_empty());
    }

    #[tokio::test]
    async fn test_warm_cache_with_sentinel() {
        let cache = FakeCache::default();
        warm_cache(&cache, Some("keel:warm")).await.unwrap();
        assert_eq!(
            cache.values.lock().get("keel:warm").map(String::as_str),
            Some("warm")
        );
    }

    #[tokio::test]
    async fn test_warm_cache_sentinel_mismatch() {
        let cache = FakeCache {
            drop_writes: true,
            ..Default::default()
        };
        let err = warm_cache(&cache, Some("keel:warm")).await.unwrap_err();
        assert!(err.to_string().contains("keel:warm"));

        warm_cache(&cache, None).await.unwrap();
    }
}
