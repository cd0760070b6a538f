//! Queue Store
//!
//! Optional durable record of queue items. Records track the lifecycle
//! pending -> processing -> (deleted | failed | cancelled) and serve as an
//! audit log; task closures are never persisted, so nothing is replayed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

/// Caller-supplied metadata of a queue item
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Status of a persisted queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Processing,
    Failed,
    Cancelled,
}

/// Persisted view of one queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: String,
    pub agent_id: String,
    pub metadata: Metadata,
    pub status: RecordStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl QueueRecord {
    /// Create a pending record
    pub fn pending(id: String, agent_id: String, metadata: Metadata, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            agent_id,
            metadata,
            status: RecordStatus::Pending,
            enqueued_at,
            updated_at: enqueued_at,
            error: None,
        }
    }
}

/// Durable store for queue records
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Record a newly enqueued item
    async fn record_enqueued(&self, record: QueueRecord) -> anyhow::Result<()>;

    /// Mark an item as being executed
    async fn mark_processing(&self, id: &str) -> anyhow::Result<()>;

    /// Delete the record of a delivered item
    async fn remove(&self, id: &str) -> anyhow::Result<()>;

    /// Mark an item as failed for good
    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()>;

    /// Mark an item as dropped by an administrative reset
    async fn mark_cancelled(&self, id: &str, reason: &str) -> anyhow::Result<()>;

    /// Records currently held for an agent
    async fn records(&self, agent_id: &str) -> anyhow::Result<Vec<QueueRecord>>;
}

/// In-memory queue store
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    records: Arc<RwLock<HashMap<String, QueueRecord>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(&self, id: &str, status: RecordStatus, error: Option<&str>) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown queue record: {}", id))?;
        record.status = status;
        record.updated_at = Utc::now();
        if let Some(error) = error {
            record.error = Some(error.to_string());
        }
        Ok(())
    }

    /// Number of records held
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn record_enqueued(&self, record: QueueRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn mark_processing(&self, id: &str) -> anyhow::Result<()> {
        self.update(id, RecordStatus::Processing, None).await
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()> {
        self.update(id, RecordStatus::Failed, Some(error)).await
    }

    async fn mark_cancelled(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.update(id, RecordStatus::Cancelled, Some(reason)).await
    }

    async fn records(&self, agent_id: &str) -> anyhow::Result<Vec<QueueRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<QueueRecord> = records
            .values()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.enqueued_at);
        Ok(out)
    }
}

/// One line of the JSON-lines audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogLine {
    Enqueued { record: QueueRecord },
    Processing { id: String, at: DateTime<Utc> },
    Removed { id: String, at: DateTime<Utc> },
    Failed { id: String, error: String, at: DateTime<Utc> },
    Cancelled { id: String, reason: String, at: DateTime<Utc> },
}

/// Append-only JSON-lines queue store
///
/// `records` replays the log, so it reflects every write made through any
/// store pointing at the same file.
#[derive(Debug)]
pub struct JsonlQueueStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonlQueueStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &LogLine) -> anyhow::Result<()> {
        let mut encoded = serde_json::to_string(line)?;
        encoded.push('\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for JsonlQueueStore {
    async fn record_enqueued(&self, record: QueueRecord) -> anyhow::Result<()> {
        self.append(&LogLine::Enqueued { record }).await
    }

    async fn mark_processing(&self, id: &str) -> anyhow::Result<()> {
        self.append(&LogLine::Processing {
            id: id.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.append(&LogLine::Removed {
            id: id.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()> {
        self.append(&LogLine::Failed {
            id: id.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn mark_cancelled(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        self.append(&LogLine::Cancelled {
            id: id.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn records(&self, agent_id: &str) -> anyhow::Result<Vec<QueueRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // Replay keeps insertion order
        let mut order: Vec<String> = Vec::new();
        let mut records: HashMap<String, QueueRecord> = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogLine>(line) {
                Ok(LogLine::Enqueued { record }) => {
                    order.push(record.id.clone());
                    records.insert(record.id.clone(), record);
                }
                Ok(LogLine::Processing { id, at }) => {
                    apply_status(&mut records, &id, RecordStatus::Processing, None, at)
                }
                Ok(LogLine::Removed { id, .. }) => {
                    records.remove(&id);
                }
                Ok(LogLine::Failed { id, error, at }) => {
                    apply_status(&mut records, &id, RecordStatus::Failed, Some(error), at)
                }
                Ok(LogLine::Cancelled { id, reason, at }) => {
                    apply_status(&mut records, &id, RecordStatus::Cancelled, Some(reason), at)
                }
                Err(e) => warn!("Skipping malformed queue log line in {:?}: {}", self.path, e),
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .filter(|r| r.agent_id == agent_id)
            .collect())
    }
}

fn apply_status(
    records: &mut HashMap<String, QueueRecord>,
    id: &str,
    status: RecordStatus,
    error: Option<String>,
    at: DateTime<Utc>,
) {
    if let Some(record) = records.get_mut(id) {
        record.status = status;
        record.updated_at = at;
        if error.is_some() {
            record.error = error;
        }
    }
}

/// Store writes emitted by a throttle
#[derive(Debug)]
pub(crate) enum StoreEvent {
    Enqueued(QueueRecord),
    Processing(String),
    Sent(String),
    Failed(String, String),
    Cancelled(String, String),
}

/// Non-blocking, ordered writer in front of a store
///
/// Events go through an unbounded channel drained by one task, so callers
/// never await the store. Store errors are logged and dropped.
#[derive(Debug, Clone)]
pub(crate) struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl StoreWriter {
    /// Spawn the writer task; must be called inside a Tokio runtime
    pub(crate) fn spawn(agent_id: String, store: Arc<dyn QueueStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    StoreEvent::Enqueued(record) => store.record_enqueued(record.clone()).await,
                    StoreEvent::Processing(id) => store.mark_processing(id).await,
                    StoreEvent::Sent(id) => store.remove(id).await,
                    StoreEvent::Failed(id, error) => store.mark_failed(id, error).await,
                    StoreEvent::Cancelled(id, reason) => store.mark_cancelled(id, reason).await,
                };
                if let Err(e) = result {
                    warn!("Agent {} queue store write failed ({:?}): {:#}", agent_id, event, e);
                }
            }
        });
        Self { tx }
    }

    pub(crate) fn send(&self, event: StoreEvent) {
        if self.tx.send(event).is_err() {
            warn!("Queue store writer has stopped; dropping event");
        }
    }
}
