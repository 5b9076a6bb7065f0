//! 消息资源描述符
//!
//! 声明式描述需要保证存在的 stream / topic，启动时加载，之后不可变

use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Stream 保留策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// 按容量/时间限制保留
    #[default]
    #[display("limits")]
    Limits,
    /// 存在消费者兴趣时保留
    #[display("interest")]
    Interest,
    /// 消费即删除（工作队列）
    #[serde(alias = "work_queue")]
    #[display("workqueue")]
    WorkQueue,
}

/// JetStream stream 描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// 消息最长保留时间（秒），0 表示不限制
    #[serde(default)]
    pub max_age_secs: u64,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn default_replicas() -> usize {
    1
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::default(),
            max_age_secs: 0,
            replicas: default_replicas(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Pulsar topic 描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// 分区数量，0 表示非分区 topic
    #[serde(default)]
    pub partitions: u32,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitions > 0
    }
}
