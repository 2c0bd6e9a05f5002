#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod auth;
pub mod cli;
pub mod comments;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod logging;
pub mod reddit;
pub mod server;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
