//! Per-agent metrics
//!
//! Counters and the moving average of gate wait time for a single throttle.
//! When metrics are enabled the same events are mirrored to the process-wide
//! Prometheus registry, labelled by agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::metrics as prom;

/// Last terminal failure of a throttle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

/// Metrics value object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    /// Attempts recorded, retries included
    pub total_attempts: u64,
    /// Cumulative moving average of gate wait, in milliseconds
    pub average_wait_ms: f64,
    pub last_error: Option<LastError>,
}

impl Metrics {
    fn empty() -> Self {
        Self {
            total_sent: 0,
            total_failed: 0,
            total_retries: 0,
            total_attempts: 0,
            average_wait_ms: 0.0,
            last_error: None,
        }
    }

    /// Percentage of settled messages that were delivered
    ///
    /// Zero when nothing has settled yet.
    pub fn success_rate_pct(&self) -> f64 {
        let settled = self.total_sent + self.total_failed;
        if settled == 0 {
            0.0
        } else {
            self.total_sent as f64 / settled as f64 * 100.0
        }
    }
}

/// Cumulative moving average step
pub fn moving_average(avg: f64, sample: f64, n: u64) -> f64 {
    if n == 0 {
        return avg;
    }
    avg + (sample - avg) / n as f64
}

/// Accumulates metrics for one throttle
#[derive(Debug)]
pub struct MetricsRecorder {
    agent_id: String,
    enabled: bool,
    started: Mutex<(Instant, DateTime<Utc>)>,
    inner: Mutex<Metrics>,
}

impl MetricsRecorder {
    pub fn new(agent_id: impl Into<String>, enabled: bool) -> Self {
        if enabled {
            if let Err(e) = prom::init() {
                tracing::warn!("Failed to register throttle metrics: {}", e);
            }
        }
        Self {
            agent_id: agent_id.into(),
            enabled,
            started: Mutex::new((Instant::now(), Utc::now())),
            inner: Mutex::new(Metrics::empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn with<R>(&self, f: impl FnOnce(&mut Metrics) -> R) -> R {
        let mut metrics = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut metrics)
    }

    /// Record one send attempt and the time it waited on the gate
    pub fn record_attempt(&self, waited: Duration, succeeded: bool) {
        if !self.enabled {
            return;
        }
        let waited_ms = waited.as_secs_f64() * 1000.0;
        self.with(|m| {
            m.total_attempts += 1;
            m.average_wait_ms = moving_average(m.average_wait_ms, waited_ms, m.total_attempts);
        });

        let outcome = if succeeded { "success" } else { "failure" };
        prom::THROTTLE_ATTEMPTS_TOTAL
            .with_label_values(&[&self.agent_id, outcome])
            .inc();
        prom::THROTTLE_GATE_WAIT_SECONDS
            .with_label_values(&[&self.agent_id])
            .observe(waited.as_secs_f64());
    }

    /// Record a delivered message
    pub fn record_sent(&self) {
        if !self.enabled {
            return;
        }
        self.with(|m| m.total_sent += 1);
        prom::THROTTLE_SENT_TOTAL
            .with_label_values(&[&self.agent_id])
            .inc();
    }

    /// Record a retry being scheduled after a failed attempt
    pub fn record_retry(&self) {
        if !self.enabled {
            return;
        }
        self.with(|m| m.total_retries += 1);
        prom::THROTTLE_RETRIES_TOTAL
            .with_label_values(&[&self.agent_id])
            .inc();
    }

    /// Record a message that failed for good
    pub fn record_terminal_failure(&self, message: &str, attempts: u32) {
        if !self.enabled {
            return;
        }
        self.with(|m| {
            m.total_failed += 1;
            m.last_error = Some(LastError {
                message: message.to_string(),
                timestamp: Utc::now(),
                attempts,
            });
        });
        prom::THROTTLE_FAILED_TOTAL
            .with_label_values(&[&self.agent_id])
            .inc();
    }

    /// Mirror the current queue depth
    pub fn set_queue_depth(&self, depth: usize) {
        if self.enabled {
            prom::THROTTLE_QUEUE_DEPTH
                .with_label_values(&[&self.agent_id])
                .set(depth as i64);
        }
    }

    /// Copy of the current metrics
    pub fn snapshot(&self) -> Metrics {
        self.with(|m| m.clone())
    }

    /// Time since creation or the last reset
    pub fn uptime(&self) -> Duration {
        let started = self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started.0.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        let started = self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started.1
    }

    /// Zero all counters and restart the uptime clock
    ///
    /// The agent's Prometheus series are dropped as well, so the exporter
    /// and status snapshots start from zero together.
    pub fn reset(&self) {
        self.with(|m| *m = Metrics::empty());
        if self.enabled {
            prom::forget_agent(&self.agent_id);
        }
        let mut started = self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *started = (Instant::now(), Utc::now());
    }
}
