//! keel-bootstrap - 平台启动编排
//!
//! 在业务服务开始接收流量前，把依赖拓扑（关系型存储、缓存、两种消息中间件）
//! 带到已验证的就绪状态

mod checker;
mod clients;
mod health;
mod metrics;
mod orchestrator;
mod phases;
mod probe;
mod runtime;

pub use checker::*;
pub use clients::*;
pub use health::*;
pub use metrics::*;
pub use orchestrator::*;
pub use phases::*;
pub use probe::probe;
pub use runtime::*;
