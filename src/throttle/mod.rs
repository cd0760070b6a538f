//! Per-Agent Throttling Module
//!
//! This module paces outbound calls to a rate-limited delivery API on behalf
//! of many independent agents sharing one process.
//!
//! # Features
//!
//! - Minimum-interval gate per agent, stamped after every attempt
//! - Bounded FIFO dispatch queue with a single worker per agent
//! - Per-attempt timeout and fixed-delay retries
//! - Per-agent metrics and status snapshots
//! - Optional queue store used as an audit log
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Throttle Registry                         │
//! │            agent id  ──►  Throttle (one per agent)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐         │
//! │  │ Dispatch    │─►│ Retry       │─►│ Rate Gate   │         │
//! │  │ Queue       │  │ Executor    │  │             │         │
//! │  └─────────────┘  └─────────────┘  └─────────────┘         │
//! │         │                │                                   │
//! │  ┌─────────────┐  ┌─────────────┐                           │
//! │  │ Queue Store │  │ Metrics     │                           │
//! │  │ (optional)  │  │ Recorder    │                           │
//! │  └─────────────┘  └─────────────┘                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dispatch_throttle::throttle::{Metadata, ThrottleRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = ThrottleRegistry::default_config();
//!     let throttle = registry.get("agent-42", None).await?;
//!
//!     let receipt = throttle.enqueue(|| async { Ok("queued") }, Metadata::new())?;
//!     let direct = throttle.send(|| async { Ok("direct") }).await?;
//!
//!     println!("{} {}", receipt.await?, direct);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod status;
pub mod store;

pub use agent::Throttle;
pub use config::{ThrottleConfig, ThrottleOverrides};
pub use error::{Result, ThrottleError};
pub use gate::RateGate;
pub use metrics::{LastError, Metrics, MetricsRecorder};
pub use queue::{Completion, DispatchQueue, QueueItemInfo};
pub use registry::ThrottleRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
pub use status::{RegistryOverview, ThrottleStatus};
pub use store::{InMemoryQueueStore, JsonlQueueStore, Metadata, QueueRecord, QueueStore, RecordStatus};
