//! ports - 抽象 trait 层
//!
//! 编排器通过这些 trait 驱动依赖客户端，测试中可以替换为假实现

mod cache;
mod messaging;
mod schema;

pub use cache::*;
pub use messaging::*;
pub use schema::*;
