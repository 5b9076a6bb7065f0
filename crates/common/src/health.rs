//! 依赖探测结果
//!
//! 每次探测产生一个 `ProbeResult`，一轮探测的结果按依赖名称聚合

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 单个依赖的探测结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// 依赖名称
    pub name: String,
    /// 是否健康
    pub ok: bool,
    /// 探测耗时（毫秒）
    pub latency_ms: u64,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    /// 创建健康结果
    pub fn healthy(name: impl Into<String>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            ok: true,
            latency_ms: latency.as_millis() as u64,
            error: None,
        }
    }

    /// 创建不健康结果
    pub fn unhealthy(name: impl Into<String>, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            latency_ms: latency.as_millis() as u64,
            error: Some(error.into()),
        }
    }

    /// 创建超时结果
    pub fn timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self::unhealthy(
            name,
            timeout,
            format!("probe timed out after {}ms", timeout.as_millis()),
        )
    }
}

/// 一轮探测的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

impl HealthSummary {
    pub fn from_results(results: &HashMap<String, ProbeResult>) -> Self {
        let healthy = results.values().filter(|r| r.ok).count();
        Self {
            healthy,
            unhealthy: results.len() - healthy,
        }
    }

    pub fn total(&self) -> usize {
        self.healthy + self.unhealthy
    }

    /// 是否所有依赖都健康（空集合视为健康）
    pub fn is_fully_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_result_constructors() {
        let ok = ProbeResult::healthy("postgres", Duration::from_millis(12));
        assert!(ok.ok);
        assert_eq!(ok.latency_ms, 12);
        assert!(ok.error.is_none());

        let failed = ProbeResult::unhealthy("redis", Duration::from_millis(3), "dial failed");
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("dial failed"));

        let timed_out = ProbeResult::timeout("nats", Duration::from_secs(5));
        assert!(!timed_out.ok);
        assert!(timed_out.error.unwrap().contains("5000ms"));
    }

    #[test]
    fn test_error_omitted_when_healthy() {
        let json = serde_json::to_value(ProbeResult::healthy("pulsar", Duration::ZERO)).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["ok"], true);
    }

    #[test]
    fn test_health_summary() {
        let mut results = HashMap::new();
        results.insert(
            "postgres".to_string(),
            ProbeResult::healthy("postgres", Duration::from_millis(1)),
        );
        results.insert(
            "redis".to_string(),
            ProbeResult::unhealthy("redis", Duration::from_millis(1), "refused"),
        );

        let summary = HealthSummary::from_results(&results);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.total(), 2);
        assert!(!summary.is_fully_healthy());
        assert!(HealthSummary::default().is_fully_healthy());
    }
}
