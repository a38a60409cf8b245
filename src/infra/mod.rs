//! Infrastructure - configuration, logging and metrics
//!
//! - `config` - Application configuration (TOML loading, env overrides, defaults)
//! - `logging` - Tracing subscriber setup
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, OperatingMode, UnknownExitPolicy};
pub use metrics::Metrics;
