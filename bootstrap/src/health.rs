//! 健康检查模块
//!
//! 提供 /health、/health/deep 和 /ready 端点

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use http::StatusCode;
use keel_common::{HealthSummary, ProbeResult};
use keel_config::ServerConfig;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::checker::DependencyChecker;

/// 就绪标志，只会从 false 变为 true
#[derive(Debug, Clone, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!("Service marked ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 浅层健康检查响应
#[derive(Debug, Clone, Serialize)]
pub struct ShallowHealth {
    pub status: &'static str,
    pub mode: &'static str,
}

/// 单个依赖状态
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ProbeResult> for DependencyStatus {
    fn from(result: ProbeResult) -> Self {
        Self {
            ok: result.ok,
            latency_ms: result.latency_ms,
            error: result.error,
        }
    }
}

/// 深度健康检查响应
#[derive(Debug, Clone, Serialize)]
pub struct DeepHealth {
    pub status: &'static str,
    pub mode: &'static str,
    pub dependencies: BTreeMap<String, DependencyStatus>,
}

/// 就绪检查响应
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone)]
struct HealthState {
    checker: Arc<DependencyChecker>,
    readiness: ReadinessFlag,
    cancel: CancellationToken,
}

/// 构建健康检查路由
///
/// `cancel` 触发后进行中的深度检查立即结束
pub fn health_router(
    checker: Arc<DependencyChecker>,
    readiness: ReadinessFlag,
    cancel: CancellationToken,
    request_timeout: Duration,
) -> Router {
    let state = HealthState {
        checker,
        readiness,
        cancel,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/deep", get(deep_health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
}

/// HTTP 健康检查服务器
pub struct HealthServer {
    addr: String,
    request_timeout: Duration,
    checker: Arc<DependencyChecker>,
    readiness: ReadinessFlag,
}

impl HealthServer {
    pub fn new(
        config: &ServerConfig,
        checker: Arc<DependencyChecker>,
        readiness: ReadinessFlag,
    ) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            request_timeout: config.request_timeout(),
            checker,
            readiness,
        }
    }

    /// 启动 HTTP 服务器，`shutdown` 触发后优雅退出
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve_on(listener, shutdown).await
    }

    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        let app = health_router(
            self.checker,
            self.readiness,
            shutdown.clone(),
            self.request_timeout,
        );

        info!(%addr, "Health check HTTP server starting");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("Health check HTTP server stopped");
        Ok(())
    }
}

/// Liveness 端点处理器
async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ShallowHealth {
            status: "healthy",
            mode: "shallow",
        }),
    )
}

/// 深度检查端点处理器，探测所有依赖
async fn deep_health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let results = state.checker.run_all(&state.cancel).await;
    let summary = HealthSummary::from_results(&results);

    let (code, status) = if summary.is_fully_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let dependencies = results
        .into_iter()
        .map(|(name, result)| (name, DependencyStatus::from(result)))
        .collect();

    (
        code,
        Json(DeepHealth {
            status,
            mode: "deep",
            dependencies,
        }),
    )
}

/// Readiness 端点处理器
async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (
            StatusCode::OK,
            Json(Readiness {
                ready: true,
                message: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Readiness {
                ready: false,
                message: Some("bootstrap phases have not completed".to_string()),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_flag_is_monotonic() {
        let flag = ReadinessFlag::new();
        let shared = flag.clone();
        assert!(!flag.is_ready());

        shared.mark_ready();
        assert!(flag.is_ready());
        flag.mark_ready();
        assert!(shared.is_ready());
    }

    #[test]
    fn test_dependency_status_omits_empty_error() {
        let status = DependencyStatus::from(ProbeResult::healthy(
            "postgres",
            Duration::from_millis(4),
        ));
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true, "latency_ms": 4}));
    }
}
