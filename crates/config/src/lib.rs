//! keel-config - 配置加载库
//!
//! 加载顺序（后者覆盖前者）：
//! 1. `{config_dir}/default.toml`
//! 2. `{config_dir}/{APP_ENV}.toml`
//! 3. `KEEL_` 前缀环境变量，`__` 表示嵌套，例如 `KEEL_SERVER__PORT`
//! 4. 标准 OTEL 环境变量（`OTEL_EXPORTER_OTLP_ENDPOINT` 等）
//!
//! 加载后立即校验，之后不可变。

use std::collections::HashSet;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use keel_common::{CircuitBreakerConfig, RetryConfig, StreamConfig, TopicConfig};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

const OTEL_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const OTEL_INSECURE: &str = "OTEL_EXPORTER_OTLP_INSECURE";
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 单个请求处理超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 优雅关闭等待时间
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// OTLP gRPC 端点，未配置时只输出本地日志
    pub otlp_endpoint: Option<String>,
    /// 不使用 TLS 连接 collector
    #[serde(default)]
    pub insecure: bool,
    /// 是否输出 JSON 日志（生产环境总是 JSON）
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_metric_export_interval_secs")]
    pub metric_export_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "keel-bootstrap".to_string()
}

fn default_metric_export_interval_secs() -> u64 {
    15
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            service_name: default_service_name(),
            otlp_endpoint: None,
            insecure: false,
            json_logs: false,
            metric_export_interval_secs: default_metric_export_interval_secs(),
        }
    }
}

/// 探测目标
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "probe", rename_all = "lowercase")]
pub enum ProbeTarget {
    /// TCP 建连
    Tcp { address: String },
    /// HTTP GET，2xx 视为健康
    Http { url: String },
    /// grpc.health.v1 健康检查，`service` 为空表示整个服务器
    Grpc {
        address: String,
        #[serde(default)]
        service: String,
    },
}

impl ProbeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Http { .. } => "http",
            Self::Grpc { .. } => "grpc",
        }
    }
}

/// 依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    #[serde(flatten)]
    pub target: ProbeTarget,
    /// 关键依赖：启动等待只检查关键依赖
    #[serde(default)]
    pub critical: bool,
    /// 覆盖默认探测超时（毫秒）
    pub timeout_ms: Option<u64>,
}

impl DependencyConfig {
    pub fn tcp(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ProbeTarget::Tcp {
                address: address.into(),
            },
            critical: false,
            timeout_ms: None,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ProbeTarget::Http { url: url.into() },
            critical: false,
            timeout_ms: None,
        }
    }

    pub fn grpc(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ProbeTarget::Grpc {
                address: address.into(),
                service: String::new(),
            },
            critical: false,
            timeout_ms: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// PostgreSQL 配置
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSettings {
    pub url: Secret<String>,
    /// 启动时校验存在的 schema
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: Secret<String>,
    /// 预热阶段写入并读回的哨兵键，未配置时只做 PING
    pub warm_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// NATS JetStream 配置
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    pub token: Option<Secret<String>>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Pulsar 配置
#[derive(Debug, Clone, Deserialize)]
pub struct PulsarSettings {
    pub url: String,
    /// Admin REST 地址，创建分区 topic 时需要
    pub admin_url: Option<String>,
    #[serde(default = "default_pulsar_tenant")]
    pub tenant: String,
    #[serde(default = "default_pulsar_namespace")]
    pub namespace: String,
    pub token: Option<Secret<String>>,
    #[serde(default = "default_connect_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

fn default_pulsar_tenant() -> String {
    "public".to_string()
}

fn default_pulsar_namespace() -> String {
    "default".to_string()
}

/// 断路器配置
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
    #[serde(default = "default_breaker_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_breaker_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_half_open_max_requests() -> u32 {
    3
}

fn default_breaker_interval_secs() -> u64 {
    10
}

fn default_breaker_open_timeout_secs() -> u64 {
    30
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            half_open_max_requests: default_half_open_max_requests(),
            interval_secs: default_breaker_interval_secs(),
            open_timeout_secs: default_breaker_open_timeout_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            half_open_max_requests: self.half_open_max_requests,
            interval: Duration::from_secs(self.interval_secs),
            open_timeout: Duration::from_secs(self.open_timeout_secs),
        }
    }
}

/// 启动编排配置
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// 单个阶段的最大总耗时
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// 单个阶段的最大尝试次数，0 表示只受总耗时限制
    #[serde(default)]
    pub retry_attempts: u32,
    /// 初始退避间隔
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_max_interval_secs")]
    pub retry_max_interval_secs: u64,
    /// 收到关闭信号后，允许进行中的阶段继续运行的时间
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// 启动时等待关键依赖的最长时间
    #[serde(default = "default_dependency_wait_secs")]
    pub dependency_wait_secs: u64,
    #[serde(default = "default_dependency_poll_secs")]
    pub dependency_poll_secs: u64,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
    pub postgres: Option<PostgresSettings>,
    pub redis: Option<RedisSettings>,
    pub nats: Option<NatsSettings>,
    pub pulsar: Option<PulsarSettings>,
}

fn default_phase_timeout_secs() -> u64 {
    300
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_retry_max_interval_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_dependency_wait_secs() -> u64 {
    30
}

fn default_dependency_poll_secs() -> u64 {
    2
}

fn default_probe_concurrency() -> usize {
    10
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: default_phase_timeout_secs(),
            retry_attempts: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_max_interval_secs: default_retry_max_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            dependency_wait_secs: default_dependency_wait_secs(),
            dependency_poll_secs: default_dependency_poll_secs(),
            probe_concurrency: default_probe_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
            circuit_breaker: CircuitBreakerSettings::default(),
            dependencies: Vec::new(),
            postgres: None,
            redis: None,
            nats: None,
            pulsar: None,
        }
    }
}

impl BootstrapConfig {
    /// 阶段重试使用的退避配置
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_secs(self.retry_max_interval_secs),
        )
        .with_max_elapsed_time(Some(self.phase_timeout()))
        .with_max_attempts(self.retry_attempts)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn dependency_wait(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_secs)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_secs(self.dependency_poll_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_concurrency == 0 {
            return Err(invalid("bootstrap.probe_concurrency must be greater than 0"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("bootstrap.probe_timeout_ms must be greater than 0"));
        }
        if self.retry_backoff_ms == 0 {
            return Err(invalid("bootstrap.retry_backoff_ms must be greater than 0"));
        }
        if self.retry_max_interval_secs == 0 {
            return Err(invalid(
                "bootstrap.retry_max_interval_secs must be greater than 0",
            ));
        }
        if self.phase_timeout_secs == 0 {
            return Err(invalid("bootstrap.phase_timeout_secs must be greater than 0"));
        }
        if self.shutdown_grace_secs == 0 {
            return Err(invalid("bootstrap.shutdown_grace_secs must be greater than 0"));
        }
        if self.monitor_interval_secs == 0 || self.dependency_poll_secs == 0 {
            return Err(invalid(
                "bootstrap.monitor_interval_secs and bootstrap.dependency_poll_secs must be greater than 0",
            ));
        }

        let mut names = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return Err(invalid("dependency name must not be empty"));
            }
            if !names.insert(dep.name.as_str()) {
                return Err(invalid(format!("duplicate dependency name: {}", dep.name)));
            }
            match &dep.target {
                ProbeTarget::Tcp { address } | ProbeTarget::Grpc { address, .. } => {
                    if !address.contains(':') {
                        return Err(invalid(format!(
                            "dependency {}: address must be host:port, got {:?}",
                            dep.name, address
                        )));
                    }
                }
                ProbeTarget::Http { url } => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        return Err(invalid(format!(
                            "dependency {}: url must start with http:// or https://",
                            dep.name
                        )));
                    }
                }
            }
        }

        if let Some(nats) = &self.nats {
            for stream in &nats.streams {
                if stream.name.trim().is_empty() || stream.subjects.is_empty() {
                    return Err(invalid(
                        "nats stream requires a name and at least one subject",
                    ));
                }
                if stream.replicas == 0 {
                    return Err(invalid(format!(
                        "nats stream {}: replicas must be at least 1",
                        stream.name
                    )));
                }
            }
        }

        if let Some(pulsar) = &self.pulsar {
            if pulsar.topics.iter().any(|t| t.name.trim().is_empty()) {
                return Err(invalid("pulsar topic name must not be empty"));
            }
            if pulsar.topics.iter().any(|t| t.is_partitioned()) && pulsar.admin_url.is_none() {
                return Err(invalid(
                    "pulsar.admin_url is required when partitioned topics are declared",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

fn default_app_name() -> String {
    "keel-bootstrap".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| default_app_env());
        Self::from_figment(Self::figment(config_dir, &env))
    }

    /// 构建分层配置源
    pub fn figment(config_dir: &str, env: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(("app_env", env))
            .merge(Env::prefixed("KEEL_").split("__"))
            .merge(otel_env())
    }

    /// 提取并校验
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.service_name.trim().is_empty() {
            return Err(invalid("telemetry.service_name must not be empty"));
        }
        if self.telemetry.metric_export_interval_secs == 0 {
            return Err(invalid(
                "telemetry.metric_export_interval_secs must be greater than 0",
            ));
        }
        self.bootstrap.validate()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

/// 标准 OTEL 环境变量映射到 telemetry 配置块
fn otel_env() -> Env {
    Env::raw()
        .only(&[OTEL_ENDPOINT, OTEL_INSECURE, OTEL_SERVICE_NAME])
        .map(|key| {
            if key.as_str().eq_ignore_ascii_case(OTEL_ENDPOINT) {
                "telemetry.otlp_endpoint".into()
            } else if key.as_str().eq_ignore_ascii_case(OTEL_INSECURE) {
                "telemetry.insecure".into()
            } else {
                "telemetry.service_name".into()
            }
        })
}

#[cfg(test)]
mod tests;
