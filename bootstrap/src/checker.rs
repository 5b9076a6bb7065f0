//! 依赖健康检查器
//!
//! 按声明的依赖列表并发探测，限制同时进行的探测数量。
//! 探测失败、超时、取消都体现为不健康的 `ProbeResult`，从不返回错误。

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use futures::future::FutureExt;
use futures::stream;
use keel_common::ProbeResult;
use keel_config::{BootstrapConfig, DependencyConfig};
use keel_errors::AppResult;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::metrics::ProbeMetrics;
use crate::probe::probe;

pub struct DependencyChecker {
    dependencies: Vec<DependencyConfig>,
    default_timeout: Duration,
    concurrency: usize,
    wait_timeout: Duration,
    poll_interval: Duration,
    http: reqwest::Client,
    metrics: Option<ProbeMetrics>,
}

impl DependencyChecker {
    pub fn new(dependencies: Vec<DependencyConfig>, default_timeout: Duration) -> Self {
        Self {
            dependencies,
            default_timeout,
            concurrency: 10,
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            http: reqwest::Client::new(),
            metrics: None,
        }
    }

    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self::new(config.dependencies.clone(), config.probe_timeout())
            .with_concurrency(config.probe_concurrency)
            .with_wait_policy(config.dependency_wait(), config.dependency_poll())
    }

    /// 同时进行的最大探测数
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 等待关键依赖的最长时间和轮询间隔
    pub fn with_wait_policy(mut self, wait_timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_metrics(mut self, metrics: ProbeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dependencies(&self) -> &[DependencyConfig] {
        &self.dependencies
    }

    /// 探测所有依赖，每个依赖恰好一条结果
    pub async fn run_all(&self, cancel: &CancellationToken) -> HashMap<String, ProbeResult> {
        self.probe_many(self.dependencies.iter(), cancel).await
    }

    /// 等待关键依赖就绪
    ///
    /// 全部健康、等待超时、`cancel` 触发时都返回 `Ok(())`，超时只记录警告
    pub async fn wait_for_dependencies(&self, cancel: &CancellationToken) -> AppResult<()> {
        let critical: Vec<&DependencyConfig> =
            self.dependencies.iter().filter(|d| d.critical).collect();
        if critical.is_empty() {
            debug!("No critical dependencies to wait for");
            return Ok(());
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            // 单轮探测不能越过等待截止时间
            let round =
                tokio::time::timeout_at(deadline, self.probe_many(critical.iter().copied(), cancel))
                    .await;
            let mut unhealthy: Vec<&str> = match &round {
                Ok(results) => results
                    .values()
                    .filter(|r| !r.ok)
                    .map(|r| r.name.as_str())
                    .collect(),
                Err(_) => critical.iter().map(|d| d.name.as_str()).collect(),
            };

            if unhealthy.is_empty() {
                info!(count = critical.len(), "All critical dependencies are healthy");
                return Ok(());
            }
            if cancel.is_cancelled() {
                debug!("Dependency wait cancelled");
                return Ok(());
            }

            unhealthy.sort_unstable();
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    unhealthy = ?unhealthy,
                    waited_secs = self.wait_timeout.as_secs(),
                    "Critical dependencies still unhealthy, continuing startup"
                );
                return Ok(());
            }

            debug!(unhealthy = ?unhealthy, "Waiting for critical dependencies");
            let next = (now + self.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = cancel.cancelled() => {
                    debug!("Dependency wait cancelled");
                    return Ok(());
                }
            }
        }
    }

    async fn probe_many<'a>(
        &'a self,
        dependencies: impl Iterator<Item = &'a DependencyConfig> + Send,
        cancel: &CancellationToken,
    ) -> HashMap<String, ProbeResult> {
        let parent = Span::current();
        stream::iter(dependencies)
            .map(|dep| self.probe_one(dep, cancel, &parent))
            .buffer_unordered(self.concurrency)
            .map(|result| (result.name.clone(), result))
            .collect::<HashMap<String, ProbeResult>>()
            .boxed()
            .await
    }

    async fn probe_one(
        &self,
        dep: &DependencyConfig,
        cancel: &CancellationToken,
        parent: &Span,
    ) -> ProbeResult {
        let timeout = dep.timeout().unwrap_or(self.default_timeout);
        let span = info_span!(
            parent: parent,
            "probe",
            dependency = %dep.name,
            kind = dep.target.kind()
        );

        let result = async {
            let started = Instant::now();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    ProbeResult::unhealthy(&dep.name, started.elapsed(), "cancelled")
                }
                outcome = tokio::time::timeout(timeout, probe(&dep.target, timeout, &self.http)) => {
                    match outcome {
                        Ok(Ok(())) => ProbeResult::healthy(&dep.name, started.elapsed()),
                        Ok(Err(e)) => ProbeResult::unhealthy(&dep.name, started.elapsed(), e),
                        Err(_) => ProbeResult::timeout(&dep.name, timeout),
                    }
                }
            }
        }
        .instrument(span)
        .await;

        if !result.ok {
            debug!(
                dependency = %result.name,
                error = result.error.as_deref().unwrap_or_default(),
                "Dependency probe failed"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_probe(&result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_address() -> String {
        let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tmp.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_run_all_one_entry_per_dependency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let closed = closed_address().await;

        let checker = DependencyChecker::new(
            vec![
                DependencyConfig::tcp("postgres", open),
                DependencyConfig::tcp("redis", closed.clone()),
                DependencyConfig::tcp("nats", closed),
            ],
            Duration::from_secs(1),
        )
        .with_concurrency(2);

        let results = checker.run_all(&CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results["postgres"].ok);
        assert!(!results["redis"].ok);
        assert!(results["nats"].error.as_deref().unwrap().contains("dial failed"));
    }

    #[tokio::test]
    async fn test_run_all_empty() {
        let checker = DependencyChecker::new(Vec::new(), Duration::from_secs(1));
        assert!(checker.run_all(&CancellationToken::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_every_dependency() {
        let closed = closed_address().await;
        let checker = DependencyChecker::new(
            vec![
                DependencyConfig::tcp("a", closed.clone()),
                DependencyConfig::tcp("b", closed),
            ],
            Duration::from_secs(1),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = checker.run_all(&cancel).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.error.as_deref() == Some("cancelled")));
    }

    #[tokio::test]
    async fn test_wait_without_critical_dependencies_returns_immediately() {
        let checker = DependencyChecker::new(
            vec![DependencyConfig::tcp("optional", closed_address().await)],
            Duration::from_secs(1),
        )
        .with_wait_policy(Duration::from_secs(30), Duration::from_secs(2));

        let started = std::time::Instant::now();
        checker
            .wait_for_dependencies(&CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
