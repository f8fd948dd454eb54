//! Cidgate - a `/gateway` reverse-proxy layer driven by content-addressed transforms
//!
//! This library provides:
//! - A pattern router with greedy path captures and first-match-wins dispatch
//! - An ordered middleware chain with before/after/error hooks
//! - Request and response transforms located by CID and invoked per gateway
//! - A test mode that sends a gateway's transforms against any server path
//! - Meta pages reporting whether transforms and templates validate
//! - Diagnostics that surface target failures as readable error pages

pub mod archive;
pub mod cid;
pub mod config;
pub mod details;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod meta;
pub mod middleware;
pub mod pipeline;
pub mod render;
pub mod routing;
pub mod server;
pub mod service;
pub mod transform;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
