//! Pulsar 连接管理

use std::time::Duration;

use keel_errors::{AppError, AppResult};
use pulsar::{Authentication, OperationRetryOptions, Pulsar, TokioExecutor};

/// Pulsar 连接配置
#[derive(Debug, Clone)]
pub struct PulsarConfig {
    /// Broker 地址，例如 `pulsar://localhost:6650`
    pub url: String,
    /// Admin REST 地址，例如 `http://localhost:8080`
    pub admin_url: Option<String>,
    pub tenant: String,
    pub namespace: String,
    pub token: Option<String>,
    pub operation_timeout: Duration,
}

impl PulsarConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            admin_url: None,
            tenant: "public".to_string(),
            namespace: "default".to_string(),
            token: None,
            operation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_admin_url(mut self, admin_url: impl Into<String>) -> Self {
        self.admin_url = Some(admin_url.into());
        self
    }

    pub fn with_namespace(mut self, tenant: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self.namespace = namespace.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// 完整 topic 名称：`persistent://{tenant}/{namespace}/{name}`
    ///
    /// 已经带 scheme 的名称原样返回
    pub fn qualified_topic(&self, name: &str) -> String {
        if name.contains("://") {
            name.to_string()
        } else {
            format!("persistent://{}/{}/{}", self.tenant, self.namespace, name)
        }
    }
}

/// 建立 Pulsar 客户端连接
pub async fn connect(config: &PulsarConfig) -> AppResult<Pulsar<TokioExecutor>> {
    let mut builder = Pulsar::builder(config.url.as_str(), TokioExecutor)
        .with_operation_retry_options(OperationRetryOptions {
            operation_timeout: config.operation_timeout,
            ..Default::default()
        });

    if let Some(token) = &config.token {
        builder = builder.with_auth(Authentication {
            name: "token".to_string(),
            data: token.clone().into_bytes(),
        });
    }

    builder
        .build()
        .await
        .map_err(|e| AppError::dependency("pulsar", "connect", e))
}
