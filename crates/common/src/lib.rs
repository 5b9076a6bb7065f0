//! keel-common - 通用类型和工具库

pub mod circuit_breaker;
pub mod health;
pub mod retry;
pub mod types;

pub use circuit_breaker::*;
pub use health::*;
pub use retry::*;
pub use types::*;
