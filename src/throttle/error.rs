//! Throttle Error Types
//!
//! This module defines all error types that can surface from a throttle,
//! either at admission time or once a task has settled.

use std::time::Duration;

/// Error types for throttled dispatch
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// Admission rejected because the agent's queue is at capacity
    #[error("Queue full for agent {agent_id}: {capacity} items already pending")]
    QueueFull { agent_id: String, capacity: usize },

    /// A single attempt exceeded the send timeout
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The task itself failed
    #[error("Task failed: {0:#}")]
    Task(anyhow::Error),

    /// All attempts failed; carries the last underlying failure
    #[error("Gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<ThrottleError>,
    },

    /// Pending item was dropped by an administrative reset
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid throttle configuration
    #[error("Invalid throttle configuration: {0}")]
    InvalidConfig(String),

    /// The registry no longer hands out throttles
    #[error("Throttle registry is shut down")]
    ShutDown,
}

impl ThrottleError {
    /// Number of attempts made, when the error is a terminal send failure
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ThrottleError::ExhaustedRetries { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Whether this error came from an administrative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ThrottleError::Cancelled(_))
    }
}

/// Result alias for throttle operations
pub type Result<T> = std::result::Result<T, ThrottleError>;
