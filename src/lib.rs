//! Dispatch Throttle Library
//!
//! This library paces outbound calls to rate-limited delivery APIs on behalf
//! of many agents, including the per-agent throttle engine, Prometheus
//! metrics, configuration loading, and the admin HTTP surface.

pub mod config;
pub mod metrics;
pub mod server;
pub mod throttle;

pub use config::Config;
pub use throttle::{Throttle, ThrottleConfig, ThrottleError, ThrottleRegistry, ThrottleStatus};
