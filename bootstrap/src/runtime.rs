//! 服务运行时

use keel_config::AppConfig;
use keel_errors::AppResult;
use keel_telemetry::TelemetryProvider;
use tracing::{error, info};

/// 服务运行时配置
pub struct RuntimeConfig {
    pub config_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_dir: "config".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// 读取 `KEEL_CONFIG_DIR`，未设置时使用 `config`
    pub fn from_env() -> Self {
        std::env::var("KEEL_CONFIG_DIR")
            .map(|config_dir| Self { config_dir })
            .unwrap_or_default()
    }
}

/// 初始化服务运行时（日志、追踪、指标）
pub fn init_runtime(config: &AppConfig) -> AppResult<TelemetryProvider> {
    let telemetry = TelemetryProvider::init(&config.telemetry, &config.app_env)?;

    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        "Runtime initialized"
    );
    Ok(telemetry)
}

/// 等待关闭信号
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
