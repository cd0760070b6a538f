//! Throttle Registry
//!
//! Map from agent identity to its throttle. Throttles are created lazily on
//! first lookup and live until explicitly removed; nothing is evicted
//! implicitly. The registry is an ordinary value, so tests and embedders can
//! run several independent ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::agent::Throttle;
use super::config::{ThrottleConfig, ThrottleOverrides};
use super::error::{Result, ThrottleError};
use super::status::{RegistryOverview, ThrottleStatus};
use super::store::QueueStore;
use crate::config::Config;
use crate::metrics as prom;

/// Process-wide registry of per-agent throttles
#[derive(Debug, Clone)]
pub struct ThrottleRegistry {
    /// Defaults every new throttle starts from
    defaults: ThrottleConfig,

    /// Configured per-agent overrides, used when `get` is called without any
    agent_overrides: Arc<HashMap<String, ThrottleOverrides>>,

    /// Store handed to throttles that enable persistence
    store: Option<Arc<dyn QueueStore>>,

    throttles: Arc<RwLock<HashMap<String, Throttle>>>,

    closed: Arc<AtomicBool>,
}

impl ThrottleRegistry {
    /// Create a registry with the given defaults and optional queue store
    pub fn new(defaults: ThrottleConfig, store: Option<Arc<dyn QueueStore>>) -> Self {
        Self {
            defaults,
            agent_overrides: Arc::new(HashMap::new()),
            store,
            throttles: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a registry from the application configuration
    ///
    /// Uses the `[throttle]` defaults, the `[agents.<id>]` overrides and the
    /// configured queue store.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.throttle.clone(), Some(config.queue_store()))
            .with_agent_overrides(config.agents.clone())
    }

    /// Create a registry with the documented defaults and no store
    pub fn default_config() -> Self {
        Self::new(ThrottleConfig::default(), None)
    }

    /// Attach per-agent overrides
    pub fn with_agent_overrides(mut self, overrides: HashMap<String, ThrottleOverrides>) -> Self {
        self.agent_overrides = Arc::new(overrides);
        self
    }

    pub fn defaults(&self) -> &ThrottleConfig {
        &self.defaults
    }

    /// Get the throttle of an agent, creating it on first use
    ///
    /// The first caller's configuration wins; a later call with different
    /// overrides keeps the existing throttle and logs a warning.
    pub async fn get(&self, agent_id: &str, overrides: Option<ThrottleOverrides>) -> Result<Throttle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ThrottleError::ShutDown);
        }

        let overrides = overrides.or_else(|| self.agent_overrides.get(agent_id).cloned());
        let requested = overrides
            .as_ref()
            .map(|o| o.merge_over(&self.defaults))
            .unwrap_or_else(|| self.defaults.clone());

        {
            let throttles = self.throttles.read().await;
            if let Some(existing) = throttles.get(agent_id) {
                Self::warn_on_mismatch(existing, overrides.as_ref(), &requested);
                return Ok(existing.clone());
            }
        }

        let mut throttles = self.throttles.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ThrottleError::ShutDown);
        }
        if let Some(existing) = throttles.get(agent_id) {
            Self::warn_on_mismatch(existing, overrides.as_ref(), &requested);
            return Ok(existing.clone());
        }

        let throttle = Throttle::new(agent_id, requested, self.store.clone())?;
        throttles.insert(agent_id.to_string(), throttle.clone());
        Ok(throttle)
    }

    fn warn_on_mismatch(
        existing: &Throttle,
        overrides: Option<&ThrottleOverrides>,
        requested: &ThrottleConfig,
    ) {
        if overrides.is_some() && existing.config() != requested {
            warn!(
                "Throttle for agent {} already exists; ignoring differing configuration",
                existing.agent_id()
            );
        }
    }

    /// Existing throttle of an agent, without creating one
    pub async fn lookup(&self, agent_id: &str) -> Option<Throttle> {
        self.throttles.read().await.get(agent_id).cloned()
    }

    /// Status of an agent's throttle, if it exists
    pub async fn status(&self, agent_id: &str) -> Option<ThrottleStatus> {
        self.lookup(agent_id).await.map(|t| t.status())
    }

    /// Remove an agent's throttle, cancelling its pending items
    pub async fn remove(&self, agent_id: &str) -> bool {
        let removed = self.throttles.write().await.remove(agent_id);
        match removed {
            Some(throttle) => {
                throttle.cancel_pending("throttle removed");
                prom::forget_agent(agent_id);
                info!("Removed throttle for agent {}", agent_id);
                true
            }
            None => false,
        }
    }

    /// Cancel all pending items and drop every throttle
    pub async fn reset_all(&self) {
        let drained: Vec<Throttle> = {
            let mut throttles = self.throttles.write().await;
            throttles.drain().map(|(_, t)| t).collect()
        };
        for throttle in &drained {
            throttle.cancel_pending("registry reset");
            prom::forget_agent(throttle.agent_id());
        }
        info!("Reset throttle registry ({} throttles dropped)", drained.len());
    }

    /// Reset one agent's pacing and metrics
    pub async fn reset_one(&self, agent_id: &str, clear_queue: bool) -> bool {
        match self.lookup(agent_id).await {
            Some(throttle) => {
                throttle.reset(clear_queue);
                true
            }
            None => false,
        }
    }

    /// Zero one agent's metrics
    pub async fn clear_metrics(&self, agent_id: &str) -> bool {
        match self.lookup(agent_id).await {
            Some(throttle) => {
                throttle.clear_metrics();
                true
            }
            None => false,
        }
    }

    /// Known agent ids, sorted
    pub async fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.throttles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live throttles
    pub async fn count(&self) -> usize {
        self.throttles.read().await.len()
    }

    /// Snapshot of every throttle
    pub async fn overview(&self) -> RegistryOverview {
        let statuses = self
            .throttles
            .read()
            .await
            .values()
            .map(|t| t.status())
            .collect();
        RegistryOverview::from_statuses(statuses)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop handing out throttles and cancel everything pending
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Throttle> = {
            let mut throttles = self.throttles.write().await;
            throttles.drain().map(|(_, t)| t).collect()
        };
        let cancelled: usize = drained
            .iter()
            .map(|t| t.cancel_pending("registry shut down"))
            .sum();
        info!(
            "Throttle registry shut down ({} throttles, {} pending items cancelled)",
            drained.len(),
            cancelled
        );
    }
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        Self::default_config()
    }
}
