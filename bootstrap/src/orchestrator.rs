//! 启动编排器
//!
//! `run` 启动后台依赖监控、一次性依赖快照和所有已配置的阶段，
//! 然后等待关闭信号。阶段互相独立地重试，不阻塞 HTTP 服务。
//!
//! 每个阶段有两个取消范围：
//! - 阶段范围：根 token 的子 token，阶段总耗时到达上限时取消
//! - 关闭信号：触发后再给阶段 `shutdown_grace` 的宽限期，之后取消阶段范围

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use keel_common::{HealthSummary, retry_with_backoff};
use keel_config::BootstrapConfig;
use keel_errors::{AppError, AppResult};
use keel_telemetry::TelemetryProvider;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::checker::DependencyChecker;
use crate::clients::ClientProvider;
use crate::health::ReadinessFlag;
use crate::metrics::{PhaseMetrics, ProbeMetrics};
use crate::phases::Phase;

/// 关闭时等待后台任务的额外时间
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<BootstrapConfig>,
    checker: Arc<DependencyChecker>,
    clients: Arc<dyn ClientProvider>,
    readiness: ReadinessFlag,
    root: CancellationToken,
    tracker: TaskTracker,
    phase_metrics: PhaseMetrics,
    probe_metrics: ProbeMetrics,
}

impl Orchestrator {
    /// `root` 是进程级后台范围，阶段范围从它派生
    pub fn new(
        config: BootstrapConfig,
        checker: Arc<DependencyChecker>,
        clients: Arc<dyn ClientProvider>,
        readiness: ReadinessFlag,
        root: CancellationToken,
        telemetry: &TelemetryProvider,
    ) -> Self {
        let meter = telemetry.meter();
        Self {
            config: Arc::new(config),
            checker,
            clients,
            readiness,
            root,
            tracker: TaskTracker::new(),
            phase_metrics: PhaseMetrics::new(&meter),
            probe_metrics: ProbeMetrics::new(&meter),
        }
    }

    pub fn readiness(&self) -> &ReadinessFlag {
        &self.readiness
    }

    /// 运行直到 `shutdown` 触发
    ///
    /// 不等待阶段成功；关闭时最多等待 `shutdown_grace` + 5s 让后台任务结束
    pub async fn run(&self, shutdown: CancellationToken) -> AppResult<()> {
        let span = info_span!("bootstrap");

        self.spawn_monitor(shutdown.clone(), span.clone());
        self.check_dependencies_async(shutdown.clone(), span.clone());

        let phases = Phase::configured(&self.config);
        info!(
            phases = ?phases.iter().map(Phase::name).collect::<Vec<_>>(),
            "Starting bootstrap phases"
        );

        if phases.is_empty() {
            self.readiness.mark_ready();
        }

        let remaining = Arc::new(AtomicUsize::new(phases.len()));
        for phase in phases {
            let this = self.clone();
            let shutdown = shutdown.clone();
            let remaining = remaining.clone();
            let phase_span = info_span!(parent: &span, "phase", phase = %phase);

            self.tracker.spawn(
                async move {
                    let result = this
                        .initialize_with_retry(phase, &shutdown, |_scope| {
                            let this = this.clone();
                            async move { phase.execute(this.clients.as_ref(), &this.config).await }
                        })
                        .await;

                    if result.is_ok() && remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        info!("All bootstrap phases completed");
                        this.readiness.mark_ready();
                    }
                }
                .instrument(phase_span),
            );
        }

        shutdown.cancelled().await;
        info!("Shutdown requested, waiting for background tasks");

        self.tracker.close();
        let wait = self.config.shutdown_grace() + SHUTDOWN_SLACK;
        if tokio::time::timeout(wait, self.tracker.wait()).await.is_err() {
            warn!(
                wait_secs = wait.as_secs(),
                remaining_tasks = self.tracker.len(),
                "Background tasks did not finish before shutdown deadline"
            );
        }

        Ok(())
    }

    /// 带指数退避地执行一个阶段
    ///
    /// `f` 的每次尝试都收到阶段范围的 token。阶段范围取消时，进行中的尝试以
    /// `Cancelled`（宽限期结束）或 `DeadlineExceeded`（总耗时到达上限）结束，
    /// 这两种错误不再重试
    pub async fn initialize_with_retry<F, Fut>(
        &self,
        phase: Phase,
        shutdown: &CancellationToken,
        mut f: F,
    ) -> AppResult<()>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let phase_scope = self.root.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        let _watcher_guard = done.clone().drop_guard();

        self.spawn_scope_watcher(
            phase_scope.clone(),
            shutdown.clone(),
            done,
            deadline_hit.clone(),
        );

        let started = Instant::now();
        let retry = self.config.retry_config();

        let result = retry_with_backoff(
            &retry,
            phase.name(),
            &phase_scope,
            |attempt| {
                let scope = phase_scope.clone();
                let deadline_hit = deadline_hit.clone();
                let metrics = self.phase_metrics.clone();
                let attempt_fut = f(scope.clone());

                async move {
                    debug!(phase = %phase, attempt = attempt + 1, "Running phase attempt");
                    let attempt_started = Instant::now();
                    let outcome = tokio::select! {
                        biased;
                        _ = scope.cancelled() => Err(scope_error(phase, &deadline_hit)),
                        outcome = attempt_fut => outcome,
                    };
                    metrics.record_attempt(phase.name(), attempt_started.elapsed(), outcome.is_ok());
                    outcome
                }
            },
            AppError::is_permanent,
        )
        .await;

        match &result {
            Ok(()) => info!(
                phase = %phase,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Phase completed"
            ),
            Err(e) => error!(
                phase = %phase,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Phase failed"
            ),
        }

        result.map_err(|e| e.in_phase(phase.name()))
    }

    fn spawn_scope_watcher(
        &self,
        scope: CancellationToken,
        shutdown: CancellationToken,
        done: CancellationToken,
        deadline_hit: Arc<AtomicBool>,
    ) {
        let deadline = self.config.phase_timeout();
        let grace = self.config.shutdown_grace();

        self.tracker.spawn(async move {
            let grace_expired = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            };

            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    deadline_hit.store(true, Ordering::SeqCst);
                    scope.cancel();
                }
                _ = grace_expired => {
                    scope.cancel();
                }
            }
        });
    }

    /// 后台依赖监控，直到 `shutdown` 触发
    fn spawn_monitor(&self, shutdown: CancellationToken, parent: Span) {
        let checker = self.checker.clone();
        let metrics = self.probe_metrics.clone();
        let period = self.config.monitor_interval();

        self.tracker.spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    if monitor_round(&checker, &metrics, &shutdown).await.is_none() {
                        break;
                    }
                }
                debug!("Dependency monitor stopped");
            }
            .instrument(info_span!(parent: &parent, "dependency_monitor")),
        );
    }

    /// 一次性依赖快照：等待关键依赖，然后记录所有依赖状态。结果不影响启动
    fn check_dependencies_async(&self, shutdown: CancellationToken, parent: Span) {
        let checker = self.checker.clone();

        self.tracker.spawn(
            async move {
                if let Err(e) = checker.wait_for_dependencies(&shutdown).await {
                    warn!(error = %e, "Waiting for dependencies failed");
                }
                if shutdown.is_cancelled() {
                    return;
                }

                let results = checker.run_all(&shutdown).await;
                let summary = HealthSummary::from_results(&results);
                info!(
                    healthy = summary.healthy,
                    unhealthy = summary.unhealthy,
                    total = summary.total(),
                    "Dependency snapshot"
                );

                let mut failed: Vec<_> = results.values().filter(|r| !r.ok).collect();
                failed.sort_by(|a, b| a.name.cmp(&b.name));
                for result in failed {
                    warn!(
                        dependency = %result.name,
                        error = result.error.as_deref().unwrap_or_default(),
                        "Dependency unhealthy"
                    );
                }
            }
            .instrument(info_span!(parent: &parent, "dependency_snapshot")),
        );
    }
}

/// 一轮后台监控
///
/// 关闭信号打断的一轮返回 `None`，不记录指标也不告警
async fn monitor_round(
    checker: &DependencyChecker,
    metrics: &ProbeMetrics,
    shutdown: &CancellationToken,
) -> Option<HealthSummary> {
    let results = checker.run_all(shutdown).await;
    if shutdown.is_cancelled() {
        return None;
    }

    let summary = HealthSummary::from_results(&results);
    metrics.record_summary(summary);

    if summary.is_fully_healthy() {
        debug!(healthy = summary.healthy, "Dependency monitor round");
    } else {
        warn!(
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            "Dependency monitor found unhealthy dependencies"
        );
    }
    Some(summary)
}

fn scope_error(phase: Phase, deadline_hit: &AtomicBool) -> AppError {
    if deadline_hit.load(Ordering::SeqCst) {
        AppError::deadline_exceeded(format!("phase {phase} exceeded its time limit"))
    } else {
        AppError::cancelled(format!("phase {phase} cancelled"))
    }
}
