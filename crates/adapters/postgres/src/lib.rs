//! keel-adapter-postgres - PostgreSQL 适配器

mod client;
mod connection;

pub use client::*;
pub use connection::*;
