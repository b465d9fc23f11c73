//! WorkerBridge common library
//!
//! This crate contains shared code used across WorkerBridge components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use metrics::{MetricsRegistry, METRICS};
