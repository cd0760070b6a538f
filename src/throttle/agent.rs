//! Per-agent throttle
//!
//! Bundles the rate gate, dispatch queue, retry engine and metrics of one
//! agent. `Throttle` is a cheap handle; clones share the same state.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::config::ThrottleConfig;
use super::error::Result;
use super::gate::RateGate;
use super::metrics::MetricsRecorder;
use super::queue::{self, Completion, DispatchQueue, QueueItem, QueueItemInfo};
use super::retry::{RetryExecutor, RetryPolicy};
use super::status::ThrottleStatus;
use super::store::{Metadata, QueueStore, StoreWriter};

#[derive(Debug)]
struct ThrottleInner {
    agent_id: String,
    config: ThrottleConfig,
    gate: Arc<RateGate>,
    queue: Arc<DispatchQueue>,
    executor: Arc<RetryExecutor>,
    metrics: Arc<MetricsRecorder>,
    store: Option<StoreWriter>,
}

/// Rate-limited dispatcher of one agent
#[derive(Debug, Clone)]
pub struct Throttle {
    inner: Arc<ThrottleInner>,
}

impl Throttle {
    /// Build a throttle from a validated configuration
    ///
    /// The store is only used when `enable_persistence` is set. Must be
    /// called inside a Tokio runtime when a store is attached.
    pub fn new(
        agent_id: impl Into<String>,
        config: ThrottleConfig,
        store: Option<Arc<dyn QueueStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let agent_id = agent_id.into();

        let gate = Arc::new(RateGate::new(config.min_interval()));
        let metrics = Arc::new(MetricsRecorder::new(agent_id.clone(), config.enable_metrics));
        let executor = Arc::new(RetryExecutor::new(
            agent_id.clone(),
            RetryPolicy::from_config(&config),
            gate.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(DispatchQueue::new(agent_id.clone(), config.max_queue_size));
        let store = match store {
            Some(store) if config.enable_persistence => {
                Some(StoreWriter::spawn(agent_id.clone(), store))
            }
            _ => None,
        };

        info!(
            "Created throttle for agent {} (interval {} ms, {} attempts, queue {})",
            agent_id, config.min_interval_ms, config.max_retries, config.max_queue_size
        );

        Ok(Self {
            inner: Arc::new(ThrottleInner {
                agent_id,
                config,
                gate,
                queue,
                executor,
                metrics,
                store,
            }),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    pub fn gate(&self) -> &RateGate {
        &self.inner.gate
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.inner.metrics
    }

    /// Whether two handles point at the same throttle
    pub fn same_as(&self, other: &Throttle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send now, paced against every other send of this agent
    ///
    /// Runs on the caller's task and does not take a queue slot.
    pub async fn send<F, Fut, T>(&self, mut task: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.inner.executor.execute(&mut task).await
    }

    /// Queue a task for paced delivery in FIFO order
    ///
    /// Fails immediately with `QueueFull` when the queue is at capacity;
    /// otherwise returns a future settled once the item is delivered,
    /// exhausts its retries or is cancelled.
    pub fn enqueue<F, Fut, T>(&self, task: F, metadata: Metadata) -> Result<Completion<T>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;
        let (item, completion) = QueueItem::new(task, metadata);

        let start_worker = inner.queue.push(item, inner.store.as_ref())?;
        inner.metrics.set_queue_depth(inner.queue.len());

        debug!(
            "Agent {} enqueued {} ({} pending)",
            inner.agent_id,
            completion.id(),
            inner.queue.len()
        );

        if start_worker {
            tokio::spawn(queue::run_worker(
                inner.agent_id.clone(),
                inner.queue.clone(),
                inner.executor.clone(),
                inner.metrics.clone(),
                inner.store.clone(),
            ));
        }

        Ok(completion)
    }

    /// Number of items waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether a worker is draining the queue
    pub fn is_processing(&self) -> bool {
        self.inner.queue.is_processing()
    }

    /// Pending items, head first
    pub fn pending(&self) -> Vec<QueueItemInfo> {
        self.inner.queue.pending()
    }

    /// Reject every pending item with `Cancelled`
    ///
    /// An item already executing is not interrupted.
    pub fn cancel_pending(&self, reason: &str) -> usize {
        let inner = &self.inner;
        let cancelled =
            queue::cancel_pending(&inner.queue, &inner.metrics, inner.store.as_ref(), reason);
        if cancelled > 0 {
            info!("Agent {} cancelled {} pending items: {}", inner.agent_id, cancelled, reason);
        }
        cancelled
    }

    /// Reset pacing and metrics, optionally cancelling pending items
    pub fn reset(&self, clear_queue: bool) -> usize {
        let cancelled = if clear_queue {
            self.cancel_pending("throttle reset")
        } else {
            0
        };
        self.inner.gate.reset();
        self.inner.metrics.reset();
        info!("Reset throttle for agent {}", self.inner.agent_id);
        cancelled
    }

    /// Zero the metrics without touching pacing or the queue
    pub fn clear_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Read-only snapshot of the throttle
    pub fn status(&self) -> ThrottleStatus {
        let inner = &self.inner;
        ThrottleStatus::capture(
            &inner.agent_id,
            &inner.gate,
            &inner.queue,
            &inner.metrics.snapshot(),
            inner.metrics.uptime(),
        )
    }
}
