//! 指数退避重试
//!
//! 按总耗时（而不是固定次数）限制重试，并感知取消信号。
//! 延迟不带随机抖动，相邻两次重试的间隔单调不减。

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 退避重试配置
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 初始延迟
    pub initial_interval: Duration,
    /// 最大延迟
    pub max_interval: Duration,
    /// 退避乘数
    pub multiplier: f64,
    /// 最大总耗时，`None` 表示不限制
    pub max_elapsed_time: Option<Duration>,
    /// 最大尝试次数，`None` 表示不限制
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
            max_elapsed_time: Some(Duration::from_secs(300)),
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// 创建新的重试配置
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            ..Default::default()
        }
    }

    /// 设置退避乘数
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// 设置最大总耗时
    pub fn with_max_elapsed_time(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed_time = max_elapsed;
        self
    }

    /// 设置最大尝试次数（0 表示不限制）
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    /// 计算第 n 次失败之后的延迟
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_interval.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = delay_ms.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 带指数退避的异步重试执行器
///
/// - `is_permanent` 返回 true 的错误立即返回，不再重试
/// - 下一次重试会超出 `max_elapsed_time` 时停止，返回最后一次错误
/// - `cancel` 触发后不再开始新的尝试，返回最后一次错误
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
    is_permanent: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let error = match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if is_permanent(&error) {
            warn!(
                operation = operation_name,
                attempt = attempt + 1,
                error = %error,
                "Operation failed with non-retryable error"
            );
            return Err(error);
        }

        if config
            .max_attempts
            .is_some_and(|max| attempt + 1 >= max)
        {
            warn!(
                operation = operation_name,
                attempt = attempt + 1,
                error = %error,
                "Operation failed, attempt limit reached"
            );
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        if let Some(max_elapsed) = config.max_elapsed_time {
            if started.elapsed() + delay > max_elapsed {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "Operation failed, retry time limit reached"
                );
                return Err(error);
            }
        }

        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    "Retry cancelled while backing off"
                );
                return Err(error);
            }
        }

        attempt += 1;
    }
}
