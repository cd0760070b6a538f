//! Status Reporting
//!
//! Read-only snapshots of a single throttle and of a whole registry, for
//! operators and the admin endpoint.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::config::millis;
use super::gate::RateGate;
use super::metrics::{LastError, Metrics};
use super::queue::DispatchQueue;

/// Snapshot of one agent's throttle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStatus {
    pub agent_id: String,
    pub gate_ready: bool,
    pub wait_ms: u64,
    pub queue_length: usize,
    pub processing: bool,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub success_rate_pct: f64,
    pub avg_wait_ms: f64,
    pub uptime_sec: u64,
    /// RFC 3339 time of the last attempt, or `"never"`
    pub last_send_time_iso: String,
    pub last_error: Option<LastError>,
}

impl ThrottleStatus {
    pub(crate) fn capture(
        agent_id: &str,
        gate: &RateGate,
        queue: &DispatchQueue,
        metrics: &Metrics,
        uptime: Duration,
    ) -> Self {
        let wait = gate.wait_time_remaining();
        Self {
            agent_id: agent_id.to_string(),
            gate_ready: wait.is_zero(),
            wait_ms: millis(wait),
            queue_length: queue.len(),
            processing: queue.is_processing(),
            total_sent: metrics.total_sent,
            total_failed: metrics.total_failed,
            total_retries: metrics.total_retries,
            success_rate_pct: metrics.success_rate_pct(),
            avg_wait_ms: metrics.average_wait_ms,
            uptime_sec: uptime.as_secs(),
            last_send_time_iso: format_last_send(gate.last_attempt_at()),
            last_error: metrics.last_error.clone(),
        }
    }
}

fn format_last_send(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| "never".to_string())
}

/// Summary across every throttle of a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryOverview {
    /// Timestamp of data generation
    pub timestamp: DateTime<Utc>,
    pub total_agents: usize,
    pub total_queued: usize,
    pub active_workers: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub overall_success_rate_pct: f64,
    /// Per-agent snapshots, sorted by agent id
    pub agents: Vec<ThrottleStatus>,
}

impl RegistryOverview {
    pub fn from_statuses(mut agents: Vec<ThrottleStatus>) -> Self {
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let total_sent: u64 = agents.iter().map(|s| s.total_sent).sum();
        let total_failed: u64 = agents.iter().map(|s| s.total_failed).sum();
        let settled = total_sent + total_failed;

        Self {
            timestamp: Utc::now(),
            total_agents: agents.len(),
            total_queued: agents.iter().map(|s| s.queue_length).sum(),
            active_workers: agents.iter().filter(|s| s.processing).count(),
            total_sent,
            total_failed,
            total_retries: agents.iter().map(|s| s.total_retries).sum(),
            overall_success_rate_pct: if settled == 0 {
                0.0
            } else {
                total_sent as f64 / settled as f64 * 100.0
            },
            agents,
        }
    }
}
