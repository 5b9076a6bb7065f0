//! keel-errors - 统一错误处理
//!
//! 错误分为三类：
//! - 瞬时错误（网络、超时、断路器打开）：在退避重试中继续重试
//! - 永久错误（取消、截止时间到达）：立即停止重试
//! - 启动错误（配置、遥测）：由 `main` 返回，唯一会导致进程退出的路径

use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{dependency} {operation} failed: {message}")]
    Dependency {
        dependency: String,
        operation: String,
        message: String,
    },

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("phase {phase}: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// 依赖调用失败，携带依赖名称与操作名称
    pub fn dependency(
        dependency: impl Into<String>,
        operation: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn circuit_open(dependency: impl Into<String>) -> Self {
        Self::CircuitOpen(dependency.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    pub fn telemetry(msg: impl Into<String>) -> Self {
        Self::Telemetry(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 用阶段名包装错误
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// 是否为永久错误（取消或截止时间到达），永久错误不再重试
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Cancelled(_) | Self::DeadlineExceeded(_) => true,
            Self::Phase { source, .. } => source.is_permanent(),
            _ => false,
        }
    }

    /// 错误分类标签，用作日志字段和指标属性
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Dependency { .. } => "dependency",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Phase { source, .. } => source.kind(),
            Self::Telemetry(_) => "telemetry",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
