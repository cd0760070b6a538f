// Paced retry engine for throttled sends
//
// Every attempt:
// - waits on the agent's rate gate
// - runs the task under the send timeout
// - stamps the gate whatever the outcome
// Failed attempts are retried after a fixed delay until the attempt budget
// is spent.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::config::ThrottleConfig;
use super::error::{Result, ThrottleError};
use super::gate::RateGate;
use super::metrics::MetricsRecorder;

/// Retry policy of one throttle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Bound on waiting for one attempt
    pub send_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            send_timeout: config.send_timeout(),
        }
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Wraps task execution with pacing, timeout and retries
#[derive(Debug)]
pub struct RetryExecutor {
    agent_id: String,
    policy: RetryPolicy,
    gate: Arc<RateGate>,
    metrics: Arc<MetricsRecorder>,
    /// Held across gate wait and attempt so the agent's callers share one clock
    send_slot: Mutex<()>,
}

impl RetryExecutor {
    pub fn new(
        agent_id: impl Into<String>,
        policy: RetryPolicy,
        gate: Arc<RateGate>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            policy,
            gate,
            metrics,
            send_slot: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one paced attempt
    async fn attempt<F, Fut, T>(&self, task: &mut F, attempt: u32) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _slot = self.send_slot.lock().await;
        let waited = self.gate.wait().await;

        debug!(
            "Agent {} attempt {}/{} after waiting {} ms",
            self.agent_id,
            attempt,
            self.policy.max_attempts,
            waited.as_millis()
        );

        // A panicking task is an ordinary failed attempt
        let run = AssertUnwindSafe(async { task().await }).catch_unwind();
        let outcome = match tokio::time::timeout(self.policy.send_timeout, run).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ThrottleError::Task(e)),
            Ok(Err(panic)) => Err(ThrottleError::Task(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(ThrottleError::Timeout(self.policy.send_timeout)),
        };

        self.gate.mark_attempt();
        self.metrics.record_attempt(waited, outcome.is_ok());
        outcome
    }

    /// Execute a task until it succeeds or the attempt budget is spent
    ///
    /// The task is invoked once per attempt. On terminal failure the error
    /// wraps the last underlying cause together with the attempt count.
    pub async fn execute<F, Fut, T>(&self, task: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;

        loop {
            match self.attempt(task, attempt).await {
                Ok(value) => {
                    self.metrics.record_sent();
                    debug!("Agent {} sent on attempt {}", self.agent_id, attempt);
                    return Ok(value);
                }
                Err(e) if self.policy.should_retry(attempt) => {
                    self.metrics.record_retry();
                    warn!(
                        "Agent {} attempt {} failed: {} (retrying in {} ms)",
                        self.agent_id,
                        attempt,
                        e,
                        self.policy.retry_delay.as_millis()
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Agent {} giving up after {} attempts: {}",
                        self.agent_id, attempt, e
                    );
                    self.metrics.record_terminal_failure(&e.to_string(), attempt);
                    return Err(ThrottleError::ExhaustedRetries {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor(interval_ms: u64, max_attempts: u32, delay_ms: u64) -> RetryExecutor {
        let policy = RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(delay_ms),
            send_timeout: Duration::from_millis(500),
        };
        RetryExecutor::new(
            "agent-retry",
            policy,
            Arc::new(RateGate::new(Duration::from_millis(interval_ms))),
            Arc::new(MetricsRecorder::new("agent-retry", true)),
        )
    }

    #[test]
    fn test_policy_from_config() {
        let config = ThrottleConfig::default();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
        assert_eq!(policy.send_timeout, Duration::from_secs(60));

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let exec = executor(0, 3, 10);
        let mut task = || async { Ok::<_, anyhow::Error>(7) };

        let value = exec.execute(&mut task).await.unwrap();
        assert_eq!(value, 7);

        let m = exec.metrics.snapshot();
        assert_eq!(m.total_sent, 1);
        assert_eq!(m.total_retries, 0);
        assert_eq!(m.total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_task_uses_whole_budget() {
        let exec = executor(0, 3, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut task = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("boom")) }
        };

        let err = exec.execute(&mut task).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(
            err,
            ThrottleError::ExhaustedRetries { ref last, .. } if matches!(**last, ThrottleError::Task(_))
        ));

        let m = exec.metrics.snapshot();
        assert_eq!(m.total_failed, 1);
        assert_eq!(m.total_retries, 2);
        assert_eq!(m.total_sent, 0);
        assert_eq!(m.last_error.unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_retried_as_failure() {
        let exec = executor(100, 3, 10);
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut task = move || {
            recorded.lock().unwrap().push(Instant::now());
            async {
                if true {
                    panic!("delivery crashed");
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        let err = exec.execute(&mut task).await.unwrap_err();
        assert!(!err.is_cancelled());
        match err {
            ThrottleError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("delivery crashed"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
        // The gate was stamped by the last panicking attempt too
        assert!(!exec.gate.is_ready());

        let m = exec.metrics.snapshot();
        assert_eq!(m.total_attempts, 3);
        assert_eq!(m.total_failed, 1);
        assert_eq!(m.total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let exec = executor(0, 2, 10);
        let mut task = || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(())
        };

        let err = exec.execute(&mut task).await.unwrap_err();
        match err {
            ThrottleError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ThrottleError::Timeout(d) if d == Duration::from_millis(500)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_gate_after_failure() {
        // Interval longer than the retry delay: the gate decides the spacing
        let exec = executor(200, 2, 10);
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut task = move || {
            recorded.lock().unwrap().push(Instant::now());
            async { Err::<(), _>(anyhow::anyhow!("rate limited")) }
        };

        let _ = exec.execute(&mut task).await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1].duration_since(stamps[0]) >= Duration::from_millis(200));
    }
}
