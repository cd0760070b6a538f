//! Dispatch Queue
//!
//! Bounded FIFO of pending tasks for one agent, drained by at most one worker
//! at a time. Append, pop and the worker's `processing` flag live under the
//! same lock, so the worker can never miss an item appended while it exits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::error::{Result, ThrottleError};
use super::metrics::MetricsRecorder;
use super::retry::RetryExecutor;
use super::store::{Metadata, QueueRecord, StoreEvent, StoreWriter};

/// How a queued job settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Sent,
    Failed(String),
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send + 'static>>;

/// Type-erased task plus the completion of the caller waiting on it
pub(crate) trait QueuedJob: Send {
    /// Execute through the retry engine and settle the caller's completion
    fn run(self: Box<Self>, executor: Arc<RetryExecutor>) -> JobFuture;

    /// Settle the caller's completion with `Cancelled`
    fn cancel(self: Box<Self>, reason: &str);
}

struct Job<F, T> {
    task: F,
    completion: oneshot::Sender<Result<T>>,
}

impl<F, Fut, T> QueuedJob for Job<F, T>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, executor: Arc<RetryExecutor>) -> JobFuture {
        Box::pin(async move {
            let Job {
                mut task,
                completion,
            } = *self;
            let result = executor.execute(&mut task).await;
            let outcome = match &result {
                Ok(_) => JobOutcome::Sent,
                Err(e) => JobOutcome::Failed(e.to_string()),
            };
            if completion.send(result).is_err() {
                debug!("Caller stopped waiting before the item settled");
            }
            outcome
        })
    }

    fn cancel(self: Box<Self>, reason: &str) {
        let _ = self
            .completion
            .send(Err(ThrottleError::Cancelled(reason.to_string())));
    }
}

/// Pending unit of work
pub struct QueueItem {
    pub id: String,
    pub metadata: Metadata,
    pub enqueued_at: DateTime<Utc>,
    job: Box<dyn QueuedJob>,
}

impl QueueItem {
    /// Wrap a task; returns the item and the future its caller awaits
    pub(crate) fn new<F, Fut, T>(task: F, metadata: Metadata) -> (Self, Completion<T>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = format!("msg-{}", uuid::Uuid::new_v4());
        let item = Self {
            id: id.clone(),
            metadata,
            enqueued_at: Utc::now(),
            job: Box::new(Job {
                task,
                completion: tx,
            }),
        };
        (item, Completion { id, rx })
    }

    pub fn info(&self) -> QueueItemInfo {
        QueueItemInfo {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Observability view of a pending item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemInfo {
    pub id: String,
    pub metadata: Metadata,
    pub enqueued_at: DateTime<Utc>,
}

/// Future returned by `enqueue`, resolved once the item settles
#[derive(Debug)]
pub struct Completion<T> {
    id: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Id of the queue item this completion belongs to
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ThrottleError::Cancelled(
                    "dispatch worker stopped before the item settled".to_string(),
                ))
            })
        })
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    processing: bool,
}

/// Bounded FIFO for one agent
#[derive(Debug)]
pub struct DispatchQueue {
    agent_id: String,
    capacity: usize,
    state: Mutex<QueueState>,
}

impl DispatchQueue {
    pub fn new(agent_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Whether a worker currently owns the queue
    pub fn is_processing(&self) -> bool {
        self.state().processing
    }

    /// Append an item
    ///
    /// Returns `true` when the caller must start a worker; the flag is
    /// claimed before returning. A full queue rejects without side effects.
    ///
    /// The `Enqueued` record is handed to the store writer before the item
    /// becomes visible to the worker or to a cancel.
    pub(crate) fn push(&self, item: QueueItem, store: Option<&StoreWriter>) -> Result<bool> {
        let mut state = self.state();
        if state.items.len() >= self.capacity {
            return Err(ThrottleError::QueueFull {
                agent_id: self.agent_id.clone(),
                capacity: self.capacity,
            });
        }
        if let Some(store) = store {
            store.send(StoreEvent::Enqueued(QueueRecord::pending(
                item.id.clone(),
                self.agent_id.clone(),
                item.metadata.clone(),
                item.enqueued_at,
            )));
        }
        state.items.push_back(item);
        let start_worker = !state.processing;
        state.processing = true;
        Ok(start_worker)
    }

    /// Next item for the worker; releases the worker flag when empty
    pub(crate) fn pop_next(&self) -> Option<QueueItem> {
        let mut state = self.state();
        let next = state.items.pop_front();
        if next.is_none() {
            state.processing = false;
        }
        next
    }

    /// Remove every pending item
    pub(crate) fn drain(&self) -> Vec<QueueItem> {
        self.state().items.drain(..).collect()
    }

    /// Views of the pending items, head first
    pub fn pending(&self) -> Vec<QueueItemInfo> {
        self.state().items.iter().map(QueueItem::info).collect()
    }
}

/// Drain the queue until it is empty
///
/// Task panics are caught per attempt by the executor. Each job still runs in
/// its own task so nothing can take the worker down with `processing` set.
pub(crate) async fn run_worker(
    agent_id: String,
    queue: Arc<DispatchQueue>,
    executor: Arc<RetryExecutor>,
    metrics: Arc<MetricsRecorder>,
    store: Option<StoreWriter>,
) {
    debug!("Agent {} dispatch worker started", agent_id);

    while let Some(item) = queue.pop_next() {
        metrics.set_queue_depth(queue.len());
        let QueueItem { id, job, .. } = item;

        if let Some(store) = &store {
            store.send(StoreEvent::Processing(id.clone()));
        }

        let outcome = match tokio::spawn(job.run(executor.clone())).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Agent {} item {} aborted: {}", agent_id, id, e);
                JobOutcome::Failed(format!("task aborted: {}", e))
            }
        };

        if let Some(store) = &store {
            match outcome {
                JobOutcome::Sent => store.send(StoreEvent::Sent(id)),
                JobOutcome::Failed(error) => store.send(StoreEvent::Failed(id, error)),
            }
        }
    }

    debug!("Agent {} dispatch worker idle", agent_id);
}

/// Settle every pending item with `Cancelled`; returns how many were dropped
pub(crate) fn cancel_pending(
    queue: &DispatchQueue,
    metrics: &MetricsRecorder,
    store: Option<&StoreWriter>,
    reason: &str,
) -> usize {
    let items = queue.drain();
    let count = items.len();
    for item in items {
        if let Some(store) = store {
            store.send(StoreEvent::Cancelled(item.id.clone(), reason.to_string()));
        }
        item.job.cancel(reason);
    }
    metrics.set_queue_depth(queue.len());
    count
}
