//! NATS 连接管理

use std::time::Duration;

use async_nats::ConnectOptions;
use keel_errors::{AppError, AppResult};

/// NATS 连接配置
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// 建立 NATS 连接
pub async fn connect(config: &NatsConfig) -> AppResult<async_nats::Client> {
    let options = match &config.token {
        Some(token) => ConnectOptions::with_token(token.clone()),
        None => ConnectOptions::new(),
    }
    .connection_timeout(config.connect_timeout)
    .name("keel-bootstrap");

    options
        .connect(config.url.as_str())
        .await
        .map_err(|e| AppError::dependency("nats", "connect", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://localhost:4222")
            .with_token("s3cr3t")
            .with_connect_timeout(Duration::from_secs(2));
        assert_eq!(config.token.as_deref(), Some("s3cr3t"));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }
}
