//! keel-adapter-pulsar - Apache Pulsar 适配器

mod admin;
mod client;
mod connection;

pub use admin::*;
pub use client::*;
pub use connection::*;
