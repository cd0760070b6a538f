//! Minimum-interval gate
//!
//! Tracks when the last send attempt of one agent ended and computes how long
//! the next attempt has to wait. Failed attempts stamp the gate too, so an
//! erroring provider is never hit again before the interval has elapsed.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Remaining wait given the interval and the time elapsed since the last attempt
///
/// `None` means no attempt has been made yet.
pub fn remaining_wait(min_interval: Duration, elapsed: Option<Duration>) -> Duration {
    match elapsed {
        Some(elapsed) => min_interval.saturating_sub(elapsed),
        None => Duration::ZERO,
    }
}

#[derive(Debug, Clone, Copy)]
struct LastAttempt {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Per-agent rate gate
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_attempt: Mutex<Option<LastAttempt>>,
}

impl RateGate {
    /// Create a gate that has never been used
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn last(&self) -> Option<LastAttempt> {
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time left before the next attempt may start
    pub fn wait_time_remaining(&self) -> Duration {
        let elapsed = self.last().map(|last| Instant::now().duration_since(last.at));
        remaining_wait(self.min_interval, elapsed)
    }

    /// Whether an attempt could start right now
    pub fn is_ready(&self) -> bool {
        self.wait_time_remaining().is_zero()
    }

    /// Sleep until the interval has elapsed; returns how long was waited
    pub async fn wait(&self) -> Duration {
        let remaining = self.wait_time_remaining();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        remaining
    }

    /// Stamp the end of an attempt, successful or not
    pub fn mark_attempt(&self) {
        let mut last = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(LastAttempt {
            at: Instant::now(),
            wall: Utc::now(),
        });
    }

    /// Wall-clock time of the last attempt
    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last().map(|last| last.wall)
    }

    /// Forget the last attempt so the next one proceeds immediately
    pub fn reset(&self) {
        let mut last = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = None;
    }
}
