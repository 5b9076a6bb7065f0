use std::sync::Arc;

use keel_bootstrap::{
    DependencyChecker, HealthServer, LazyClients, Orchestrator, ProbeMetrics, ReadinessFlag,
    RuntimeConfig, init_runtime, shutdown_signal,
};
use keel_config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. 加载配置
    let runtime = RuntimeConfig::from_env();
    let config = AppConfig::load(&runtime.config_dir)?;

    // 2. 初始化遥测
    let telemetry = init_runtime(&config)?;
    info!("Starting {}", config.app_name);

    // 3. 取消范围：root 覆盖所有后台工作，shutdown 由信号触发
    let root = CancellationToken::new();
    let shutdown = CancellationToken::new();

    // 4. 组件
    let readiness = ReadinessFlag::new();
    let checker = Arc::new(
        DependencyChecker::from_config(&config.bootstrap)
            .with_metrics(ProbeMetrics::new(&telemetry.meter())),
    );
    let clients = Arc::new(LazyClients::new(&config.bootstrap));
    let orchestrator = Orchestrator::new(
        config.bootstrap.clone(),
        checker.clone(),
        clients.clone(),
        readiness.clone(),
        root.clone(),
        &telemetry,
    );

    // 5. 健康检查 HTTP 服务器，绑定失败时触发关闭
    let server = HealthServer::new(&config.server, checker, readiness);
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(server_shutdown.clone()).await {
            error!(error = %e, "Health server error");
            server_shutdown.cancel();
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    // 6. 编排，直到关闭信号
    let result = orchestrator.run(shutdown.clone()).await;

    // 7. 清理：HTTP 服务器 -> 后台范围 -> 客户端 -> 遥测
    if tokio::time::timeout(config.server.shutdown_timeout(), server_handle)
        .await
        .is_err()
    {
        warn!("Health server did not stop within shutdown timeout");
    }
    root.cancel();
    clients.close().await;

    info!("Shutdown complete");
    telemetry.shutdown();

    result?;
    Ok(())
}
