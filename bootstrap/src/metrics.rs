//! Metrics 模块
//!
//! 指标从 `TelemetryProvider` 的 meter 创建，属性只包含阶段名或依赖名

use std::time::Duration;

use keel_common::{HealthSummary, ProbeResult};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// 启动阶段指标
#[derive(Clone)]
pub struct PhaseMetrics {
    duration: Histogram<f64>,
    errors: Counter<u64>,
}

impl PhaseMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            duration: meter
                .f64_histogram("keel.bootstrap.phase.duration")
                .with_description("Duration of a single bootstrap phase attempt")
                .with_unit("ms")
                .build(),
            errors: meter
                .u64_counter("keel.bootstrap.phase.errors")
                .with_description("Failed bootstrap phase attempts")
                .build(),
        }
    }

    /// 记录一次阶段尝试
    pub fn record_attempt(&self, phase: &str, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.duration.record(
            elapsed.as_secs_f64() * 1000.0,
            &[
                KeyValue::new("phase", phase.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
        if !success {
            self.errors
                .add(1, &[KeyValue::new("phase", phase.to_string())]);
        }
    }
}

/// 依赖探测指标
#[derive(Clone)]
pub struct ProbeMetrics {
    duration: Histogram<f64>,
    failures: Counter<u64>,
    healthy: Gauge<u64>,
    unhealthy: Gauge<u64>,
}

impl ProbeMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            duration: meter
                .f64_histogram("keel.checker.probe.duration")
                .with_description("Dependency probe latency")
                .with_unit("ms")
                .build(),
            failures: meter
                .u64_counter("keel.checker.probe.failures")
                .with_description("Failed dependency probes")
                .build(),
            healthy: meter
                .u64_gauge("keel.checker.dependencies.healthy")
                .with_description("Healthy dependencies in the last monitor round")
                .build(),
            unhealthy: meter
                .u64_gauge("keel.checker.dependencies.unhealthy")
                .with_description("Unhealthy dependencies in the last monitor round")
                .build(),
        }
    }

    pub fn record_probe(&self, result: &ProbeResult) {
        let attrs = [KeyValue::new("dependency", result.name.clone())];
        self.duration.record(result.latency_ms as f64, &attrs);
        if !result.ok {
            self.failures.add(1, &attrs);
        }
    }

    pub fn record_summary(&self, summary: HealthSummary) {
        self.healthy.record(summary.healthy as u64, &[]);
        self.unhealthy.record(summary.unhealthy as u64, &[]);
    }
}
