//! 断路器
//!
//! Closed -> Open -> HalfOpen 状态机，每个依赖客户端持有一个独立实例：
//! - Closed：请求正常通过；连续失败达到阈值后打开。计数每 `interval` 清零一次
//! - Open：请求直接失败，不访问网络；`open_timeout` 之后转为 HalfOpen
//! - HalfOpen：最多放行 `half_open_max_requests` 个请求，全部成功则关闭，任一失败重新打开

use std::future::Future;
use std::time::Duration;

use derive_more::Display;
use keel_errors::{AppError, AppResult};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CircuitState {
    #[display("closed")]
    Closed,
    #[display("open")]
    Open,
    #[display("half-open")]
    HalfOpen,
}

/// 断路器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// HalfOpen 状态下最多放行的请求数
    pub half_open_max_requests: u32,
    /// Closed 状态下计数清零周期
    pub interval: Duration,
    /// Open 状态持续时间
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_max_requests: 3,
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// 当前计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub requests: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: BreakerCounts,
    /// Closed：计数清零时间；Open：转为 HalfOpen 的时间
    expiry: Option<Instant>,
}

/// 断路器
///
/// 不实现 `Clone`：断路器只属于创建它的客户端
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let expiry = (!config.interval.is_zero()).then(|| Instant::now() + config.interval);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: BreakerCounts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态（会先处理到期的状态转换）
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock();
        self.refresh(&mut guard, Instant::now());
        guard.state
    }

    pub fn counts(&self) -> BreakerCounts {
        let mut guard = self.state.lock();
        self.refresh(&mut guard, Instant::now());
        guard.counts
    }

    /// 执行受保护的操作
    ///
    /// 断路器打开时直接返回 `AppError::CircuitOpen`，不调用 `operation`
    pub async fn call<F, Fut, T>(&self, operation: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let generation = self.before_call()?;
        let mut guard = CallGuard {
            breaker: self,
            generation,
            finished: false,
        };

        let result = operation().await;

        guard.finished = true;
        self.after_call(generation, result.is_ok());
        result
    }

    fn before_call(&self) -> AppResult<u64> {
        let mut guard = self.state.lock();
        self.refresh(&mut guard, Instant::now());

        match guard.state {
            CircuitState::Open => Err(AppError::circuit_open(&self.name)),
            CircuitState::HalfOpen
                if guard.counts.requests >= self.config.half_open_max_requests =>
            {
                Err(AppError::circuit_open(format!(
                    "{} (half-open request limit reached)",
                    self.name
                )))
            }
            _ => {
                guard.counts.requests += 1;
                Ok(guard.generation)
            }
        }
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut guard = self.state.lock();
        let now = Instant::now();
        self.refresh(&mut guard, now);

        // 结果属于已经过期的周期，忽略
        if guard.generation != generation {
            return;
        }

        if success {
            guard.counts.consecutive_successes += 1;
            guard.counts.consecutive_failures = 0;
            if guard.state == CircuitState::HalfOpen
                && guard.counts.consecutive_successes >= self.config.half_open_max_requests
            {
                self.transition(&mut guard, CircuitState::Closed, now);
            }
        } else {
            guard.counts.consecutive_failures += 1;
            guard.counts.consecutive_successes = 0;
            match guard.state {
                CircuitState::Closed
                    if guard.counts.consecutive_failures >= self.config.failure_threshold =>
                {
                    self.transition(&mut guard, CircuitState::Open, now);
                }
                CircuitState::HalfOpen => {
                    self.transition(&mut guard, CircuitState::Open, now);
                }
                _ => {}
            }
        }
    }

    /// 处理到期：Closed 清零计数，Open 转为 HalfOpen
    fn refresh(&self, state: &mut BreakerState, now: Instant) {
        let Some(expiry) = state.expiry else {
            return;
        };
        if now < expiry {
            return;
        }
        match state.state {
            CircuitState::Closed => self.new_generation(state, now),
            CircuitState::Open => self.transition(state, CircuitState::HalfOpen, now),
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) {
        if state.state == to {
            return;
        }
        let from = state.state;
        state.state = to;
        self.new_generation(state, now);

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %from,
                cooldown_secs = self.config.open_timeout.as_secs(),
                "Circuit breaker transitioned to OPEN"
            ),
            _ => info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed"),
        }
    }

    fn new_generation(&self, state: &mut BreakerState, now: Instant) {
        state.generation += 1;
        state.counts = BreakerCounts::default();
        state.expiry = match state.state {
            CircuitState::Closed => {
                (!self.config.interval.is_zero()).then(|| now + self.config.interval)
            }
            CircuitState::Open => Some(now + self.config.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

/// 调用被中途丢弃（例如取消）时按失败记录，避免 HalfOpen 名额泄漏
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.after_call(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// 计数的假传输层
    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicU32,
        failing: AtomicBool,
    }

    impl CountingTransport {
        fn failing() -> Self {
            let transport = Self::default();
            transport.failing.store(true, Ordering::SeqCst);
            transport
        }

        async fn send(&self) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(AppError::dependency("fake", "send", "connection refused"))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("fake", CircuitBreakerConfig::default())
    }

    async fn trip(breaker: &CircuitBreaker, transport: &CountingTransport) {
        for _ in 0..breaker.config.failure_threshold {
            let _ = breaker.call(|| transport.send()).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_transport() {
        let breaker = breaker();
        let transport = CountingTransport::failing();

        trip(&breaker, &transport).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(transport.calls(), 5);

        let result = breaker.call(|| transport.send()).await;
        assert!(matches!(result, Err(AppError::CircuitOpen(_))));
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_closes() {
        let breaker = breaker();
        let transport = CountingTransport::failing();
        trip(&breaker, &transport).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        transport.failing.store(false, Ordering::SeqCst);
        breaker.call(|| transport.send()).await.unwrap();
        assert_eq!(transport.calls(), 6);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.call(|| transport.send()).await.unwrap();
        breaker.call(|| transport.send()).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        let transport = CountingTransport::failing();
        trip(&breaker, &transport).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = breaker.call(|| transport.send()).await;
        assert!(matches!(result, Err(AppError::Dependency { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(|| transport.send()).await;
        assert!(matches!(result, Err(AppError::CircuitOpen(_))));
        assert_eq!(transport.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_request_limit() {
        let breaker = breaker();
        let transport = CountingTransport::failing();
        trip(&breaker, &transport).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        for _ in 0..3 {
            assert!(breaker.before_call().is_ok());
        }
        assert!(matches!(breaker.before_call(), Err(AppError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_counts_reset_each_interval() {
        let breaker = breaker();
        let transport = CountingTransport::failing();

        for _ in 0..4 {
            let _ = breaker.call(|| transport.send()).await;
        }
        assert_eq!(breaker.counts().consecutive_failures, 4);

        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..4 {
            let _ = breaker.call(|| transport.send()).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(transport.calls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_counts_as_failure() {
        let breaker = breaker();
        for _ in 0..5 {
            let call = breaker.call(|| std::future::pending::<AppResult<()>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
