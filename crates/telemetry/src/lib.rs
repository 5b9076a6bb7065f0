//! telemetry - 可观测性库
//!
//! `TelemetryProvider` 在进程启动时创建一次，按引用传给各组件：
//! - tracer：`tracing` span 通过 `tracing-opentelemetry` 导出
//! - meter：指标通过周期性 reader 导出
//! - logger：`tracing` 事件桥接为 OTel 日志，同时输出到本地 fmt 层
//!
//! 未配置 OTLP 端点时只输出本地日志。只有 `tracing` subscriber 是全局的。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel_config::TelemetryConfig;
use keel_errors::{AppError, AppResult};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::LoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use tracing::{info, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const INSTRUMENTATION_NAME: &str = "keel-bootstrap";

/// 进程级遥测提供者
pub struct TelemetryProvider {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: LoggerProvider,
    meter: Meter,
    exporting: bool,
    shut_down: AtomicBool,
}

impl TelemetryProvider {
    /// 创建 provider 并安装全局 `tracing` subscriber
    ///
    /// 生产环境或 `json_logs = true` 时输出 JSON 日志。
    /// `RUST_LOG` 优先于 `log_level`。
    pub fn init(config: &TelemetryConfig, app_env: &str) -> AppResult<Self> {
        let resource = build_resource(&config.service_name, app_env);
        let provider = match config.otlp_endpoint.as_deref() {
            Some(endpoint) => Self::with_otlp(config, endpoint, resource)?,
            None => Self::without_exporters(resource),
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let json = config.json_logs || app_env == "production";

        let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
        let plain_layer = (!json).then(|| tracing_subscriber::fmt::layer());

        let (otel_layer, log_bridge) = if provider.exporting {
            let tracer = provider.tracer();
            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(
                    OpenTelemetryTracingBridge::new(&provider.logger_provider)
                        .with_filter(exporter_targets()),
                ),
            )
        } else {
            (None, None)
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(plain_layer)
            .with(otel_layer)
            .with(log_bridge)
            .try_init()
            .map_err(|e| AppError::telemetry(format!("failed to install subscriber: {e}")))?;

        info!(
            service = %config.service_name,
            environment = %app_env,
            otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(provider)
    }

    /// 不带导出器、不安装全局 subscriber 的 provider（测试用）
    pub fn disabled(service_name: &str) -> Self {
        Self::without_exporters(build_resource(service_name, "test"))
    }

    fn with_otlp(config: &TelemetryConfig, endpoint: &str, resource: Resource) -> AppResult<Self> {
        let endpoint = normalize_endpoint(endpoint, config.insecure);

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()
            .map_err(|e| AppError::telemetry(format!("span exporter: {e}")))?;
        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()
            .map_err(|e| AppError::telemetry(format!("metric exporter: {e}")))?;
        let log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| AppError::telemetry(format!("log exporter: {e}")))?;

        let tracer_provider = TracerProvider::builder()
            .with_batch_exporter(span_exporter, runtime::Tokio)
            .with_resource(resource.clone())
            .build();

        let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio)
            .with_interval(Duration::from_secs(config.metric_export_interval_secs.max(1)))
            .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource.clone())
            .build();

        let logger_provider = LoggerProvider::builder()
            .with_batch_exporter(log_exporter, runtime::Tokio)
            .with_resource(resource)
            .build();

        Ok(Self::assemble(tracer_provider, meter_provider, logger_provider, true))
    }

    fn without_exporters(resource: Resource) -> Self {
        Self::assemble(
            TracerProvider::builder()
                .with_resource(resource.clone())
                .build(),
            SdkMeterProvider::builder()
                .with_resource(resource.clone())
                .build(),
            LoggerProvider::builder().with_resource(resource).build(),
            false,
        )
    }

    fn assemble(
        tracer_provider: TracerProvider,
        meter_provider: SdkMeterProvider,
        logger_provider: LoggerProvider,
        exporting: bool,
    ) -> Self {
        let meter = meter_provider.meter(INSTRUMENTATION_NAME);
        Self {
            tracer_provider,
            meter_provider,
            logger_provider,
            meter,
            exporting,
            shut_down: AtomicBool::new(false),
        }
    }

    /// 指标 meter，用于创建计数器 / 直方图 / gauge
    pub fn meter(&self) -> Meter {
        self.meter.clone()
    }

    pub fn tracer(&self) -> Tracer {
        self.tracer_provider.tracer(INSTRUMENTATION_NAME)
    }

    /// 是否配置了 OTLP 导出
    pub fn is_exporting(&self) -> bool {
        self.exporting
    }

    /// 刷新并关闭 provider，只执行一次
    ///
    /// 顺序：logger -> meter -> tracer，导出通道随 provider 一起释放。
    /// 单个 provider 关闭失败只记录日志，不影响其余 provider。
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.logger_provider.shutdown() {
            warn!(error = %e, "Failed to shut down logger provider");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            warn!(error = %e, "Failed to shut down meter provider");
        }
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!(error = %e, "Failed to shut down tracer provider");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn build_resource(service_name: &str, app_env: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("deployment.environment", app_env.to_string()),
    ])
}

/// 没有 scheme 的端点按 `insecure` 补全
fn normalize_endpoint(endpoint: &str, insecure: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

/// 导出器自身的传输层日志不能再被桥接回导出器
fn exporter_targets() -> Targets {
    Targets::new()
        .with_default(LevelFilter::TRACE)
        .with_target("h2", LevelFilter::OFF)
        .with_target("hyper", LevelFilter::OFF)
        .with_target("tonic", LevelFilter::OFF)
        .with_target("tower", LevelFilter::OFF)
        .with_target("opentelemetry", LevelFilter::OFF)
}
