//! Pulsar Admin REST 客户端
//!
//! 只覆盖分区 topic 的创建

use keel_errors::{AppError, AppResult};
use reqwest::StatusCode;
use tracing::debug;

/// 分区 topic 创建结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionedTopicOutcome {
    Created,
    AlreadyExists,
}

pub struct PulsarAdmin {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl PulsarAdmin {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: std::time::Duration,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::dependency("pulsar", "admin_client", e))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// `persistent://tenant/ns/name` 对应的 admin 路径
    pub fn partitions_url(&self, qualified_topic: &str) -> String {
        let (domain, path) = qualified_topic
            .split_once("://")
            .unwrap_or(("persistent", qualified_topic));
        format!("{}/admin/v2/{}/{}/partitions", self.base_url, domain, path)
    }

    /// 创建分区 topic，409 视为已存在
    pub async fn create_partitioned_topic(
        &self,
        qualified_topic: &str,
        partitions: u32,
    ) -> AppResult<PartitionedTopicOutcome> {
        let mut request = self
            .http
            .put(self.partitions_url(qualified_topic))
            .json(&partitions);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::dependency("pulsar", "create_topic", e))?;

        let status = response.status();
        let outcome = classify_status(status).ok_or_else(|| {
            AppError::dependency(
                "pulsar",
                "create_topic",
                format!("admin API returned {status} for {qualified_topic}"),
            )
        })?;
        debug!(topic = %qualified_topic, partitions, outcome = ?outcome, "Partitioned topic request finished");
        Ok(outcome)
    }
}

fn classify_status(status: StatusCode) -> Option<PartitionedTopicOutcome> {
    if status.is_success() {
        Some(PartitionedTopicOutcome::Created)
    } else if status == StatusCode::CONFLICT {
        Some(PartitionedTopicOutcome::AlreadyExists)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partitions_url() {
        let admin = PulsarAdmin::new("http://pulsar:8080/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            admin.partitions_url("persistent://public/default/audit"),
            "http://pulsar:8080/admin/v2/persistent/public/default/audit/partitions"
        );
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::NO_CONTENT),
            Some(PartitionedTopicOutcome::Created)
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT),
            Some(PartitionedTopicOutcome::AlreadyExists)
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), None);
    }
}
