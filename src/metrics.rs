// Prometheus metrics for throttled dispatch
//
// Exposes metrics on the /metrics HTTP endpoint, labelled by agent:
// - Sent / failed / retried messages (counters)
// - Attempts by outcome (counter)
// - Pending queue depth (gauge)
// - Time spent waiting on the rate gate (histogram)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref THROTTLE_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_sent_total", "Messages delivered successfully"),
        &["agent_id"]
    ).expect("Failed to create sent metric");

    pub static ref THROTTLE_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_failed_total", "Messages that failed after all attempts"),
        &["agent_id"]
    ).expect("Failed to create failed metric");

    pub static ref THROTTLE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_retries_total", "Retries scheduled after a failed attempt"),
        &["agent_id"]
    ).expect("Failed to create retries metric");

    pub static ref THROTTLE_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("throttle_attempts_total", "Send attempts by outcome"),
        &["agent_id", "outcome"]
    ).expect("Failed to create attempts metric");

    pub static ref THROTTLE_QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("throttle_queue_depth", "Items waiting in the dispatch queue"),
        &["agent_id"]
    ).expect("Failed to create queue depth metric");

    pub static ref THROTTLE_GATE_WAIT_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("throttle_gate_wait_seconds", "Time spent waiting on the rate gate")
            .buckets(vec![0.0, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
        &["agent_id"]
    ).expect("Failed to create gate wait metric");
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register all metrics with the registry
///
/// Safe to call more than once; only the first call registers.
pub fn init() -> prometheus::Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    REGISTRY.register(Box::new(THROTTLE_SENT_TOTAL.clone()))?;
    REGISTRY.register(Box::new(THROTTLE_FAILED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(THROTTLE_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(THROTTLE_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(THROTTLE_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(THROTTLE_GATE_WAIT_SECONDS.clone()))?;
    Ok(())
}

/// Drop every labelled series of an agent
pub fn forget_agent(agent_id: &str) {
    let _ = THROTTLE_SENT_TOTAL.remove_label_values(&[agent_id]);
    let _ = THROTTLE_FAILED_TOTAL.remove_label_values(&[agent_id]);
    let _ = THROTTLE_RETRIES_TOTAL.remove_label_values(&[agent_id]);
    let _ = THROTTLE_ATTEMPTS_TOTAL.remove_label_values(&[agent_id, "success"]);
    let _ = THROTTLE_ATTEMPTS_TOTAL.remove_label_values(&[agent_id, "failure"]);
    let _ = THROTTLE_QUEUE_DEPTH.remove_label_values(&[agent_id]);
    let _ = THROTTLE_GATE_WAIT_SECONDS.remove_label_values(&[agent_id]);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
