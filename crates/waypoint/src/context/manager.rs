//! Per-request context shaping.
//!
//! [`ContextManager`] is what the agent loop calls before every model
//! request. It renders the effective history through the task's
//! [`ContextStore`], checks it against the model's safe budget, and, when
//! over, asks the [`TruncationPlanner`] for a larger elided range until the
//! history fits or nothing more can be hidden.
//!
//! The store sits behind a per-task `tokio::sync::Mutex` shared with the
//! background [`ContextFlusher`], so requests, file-read bookkeeping,
//! flushing, and pruning never interleave.

use crate::config::ContextConfig;
use crate::context::budget::{ContextUsage, ModelContextProfile, TokenEstimator};
use crate::context::flusher::ContextFlusher;
use crate::context::overlay::{ContextUpdate, UpdateType};
use crate::context::persist::ContextPersistence;
use crate::context::planner::{TruncationPlan, TruncationPlanner, TruncationRange};
use crate::context::store::ContextStore;
use crate::error::{ContextError, PersistError};
use crate::Message;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Context manager for one task.
pub struct ContextManager {
    task_id: String,
    store: Arc<Mutex<ContextStore>>,
    planner: TruncationPlanner,
    estimator: TokenEstimator,
    /// Profile seen on the previous request, for model-switch logging.
    last_profile: Mutex<Option<ModelContextProfile>>,
    persistence: Option<Arc<dyn ContextPersistence>>,
    flusher: Option<ContextFlusher>,
}

impl ContextManager {
    /// A manager with purely in-memory state.
    pub fn new(task_id: impl Into<String>, config: ContextConfig) -> Self {
        Self::from_store(task_id.into(), ContextStore::new(&config), &config)
    }

    /// A manager backed by `persistence`: reloads any saved state for
    /// `task_id` and starts the background flusher.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(
        task_id: impl Into<String>,
        config: ContextConfig,
        persistence: Arc<dyn ContextPersistence>,
    ) -> Result<Self, PersistError> {
        let task_id = task_id.into();
        let loader = persistence.clone();
        let id = task_id.clone();
        let saved = tokio::task::spawn_blocking(move || loader.load_context(&id))
            .await
            .map_err(|e| PersistError::Read {
                path: task_id.clone().into(),
                source: std::io::Error::other(e),
            })??;

        let store = match saved {
            Some(snapshot) => {
                debug!(
                    "loaded context for task {task_id}: {} overlay updates, range {:?}",
                    snapshot.state.overlay.len(),
                    snapshot.state.range
                );
                ContextStore::from_snapshot(snapshot.state, &config)
            }
            None => ContextStore::new(&config),
        };

        let mut manager = Self::from_store(task_id, store, &config);
        manager.flusher = Some(ContextFlusher::spawn(
            manager.store.clone(),
            persistence.clone(),
            manager.task_id.clone(),
            &config,
        ));
        manager.persistence = Some(persistence);
        Ok(manager)
    }

    fn from_store(task_id: String, store: ContextStore, config: &ContextConfig) -> Self {
        Self {
            task_id,
            store: Arc::new(Mutex::new(store)),
            planner: TruncationPlanner::new(config.tail_keep),
            estimator: TokenEstimator::new(config.chars_per_token),
            last_profile: Mutex::new(None),
            persistence: None,
            flusher: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> Arc<Mutex<ContextStore>> {
        self.store.clone()
    }

    /// Render the effective history for the next request to `profile`.
    ///
    /// Returns the history unchanged (apart from overlay edits and any range
    /// elided earlier) if it fits. Otherwise the elided range grows, step by
    /// step, until it fits. Fails with [`ContextError::Exhausted`] when the
    /// planner can hide nothing more and the history is still over budget.
    pub async fn prepare_request(
        &self,
        raw: &[Message],
        profile: &ModelContextProfile,
    ) -> Result<Vec<Message>, ContextError> {
        self.note_profile(profile).await;

        let mut store = self.store.lock().await;
        store.sync_bounds(raw);

        let mut effective = store.effective_messages(raw, store.range());
        let mut usage = self.estimator.usage(&effective, profile);
        if usage.fits() {
            return Ok(effective);
        }

        loop {
            match self.planner.plan(raw, store.range(), usage.overage_ratio()) {
                TruncationPlan::Extend {
                    range,
                    severity,
                    newly_elided,
                } => {
                    let before = usage.estimated_tokens;
                    store.extend_range(range);
                    record_truncation_note(&mut store, raw, range)?;
                    effective = store.effective_messages(raw, Some(range));
                    usage = self.estimator.usage(&effective, profile);
                    debug!(
                        "task {}: {severity:?} truncation elided {newly_elided}, range now {range}, \
                         ~{before} -> ~{} tokens (budget {})",
                        self.task_id, usage.estimated_tokens, usage.safe_budget
                    );
                    if usage.fits() {
                        break;
                    }
                }
                TruncationPlan::Exhausted => {
                    drop(store);
                    self.mark_dirty();
                    warn!("task {}: {}", self.task_id, usage.to_log_string());
                    return Err(ContextError::Exhausted {
                        estimated_tokens: usage.estimated_tokens,
                        safe_budget: usage.safe_budget,
                    });
                }
            }
        }

        drop(store);
        self.mark_dirty();
        Ok(effective)
    }

    /// Record that message `message_index` carries a file read of `path`,
    /// replacing identical earlier reads with a placeholder. Returns how many
    /// earlier blocks were replaced.
    pub async fn record_file_read(
        &self,
        raw: &[Message],
        message_index: usize,
        path: &str,
    ) -> Result<usize, ContextError> {
        let replaced = self.store.lock().await.record_file_read(
            raw,
            message_index,
            path,
            chrono::Utc::now().timestamp_millis(),
        )?;
        self.mark_dirty();
        Ok(replaced)
    }

    /// Append an arbitrary overlay update.
    pub async fn record_update(
        &self,
        raw: &[Message],
        message_index: usize,
        block_index: usize,
        update_type: UpdateType,
        value: impl Into<String>,
    ) -> Result<(), ContextError> {
        {
            let mut store = self.store.lock().await;
            store.sync_bounds(raw);
            store.record_update(
                message_index,
                block_index,
                update_type,
                value,
                chrono::Utc::now().timestamp_millis(),
            )?;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Effective history under the current range, without budget checks.
    pub async fn effective_messages(&self, raw: &[Message]) -> Vec<Message> {
        let store = self.store.lock().await;
        store.effective_messages(raw, store.range())
    }

    /// Estimated usage of the current effective history against `profile`.
    pub async fn usage(&self, raw: &[Message], profile: &ModelContextProfile) -> ContextUsage {
        let effective = self.effective_messages(raw).await;
        self.estimator.usage(&effective, profile)
    }

    pub async fn range(&self) -> Option<TruncationRange> {
        self.store.lock().await.range()
    }

    /// Full retained update history for one block, oldest first.
    pub async fn updates_for(&self, message_index: usize, block_index: usize) -> Vec<ContextUpdate> {
        self.store
            .lock()
            .await
            .updates_for(message_index, block_index)
            .to_vec()
    }

    /// Persist the raw history alongside the overlay. No-op without a
    /// persistence gateway.
    pub async fn save_history(&self, raw: &[Message]) -> Result<(), PersistError> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(());
        };
        let id = self.task_id.clone();
        let messages = raw.to_vec();
        tokio::task::spawn_blocking(move || persistence.save_history(&id, &messages))
            .await
            .map_err(|e| PersistError::Write {
                path: self.task_id.clone().into(),
                source: std::io::Error::other(e),
            })?
    }

    /// Reload the raw history saved by [`save_history`](Self::save_history).
    pub async fn load_history(&self) -> Result<Option<Vec<Message>>, PersistError> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(None);
        };
        let id = self.task_id.clone();
        tokio::task::spawn_blocking(move || persistence.load_history(&id))
            .await
            .map_err(|e| PersistError::Read {
                path: self.task_id.clone().into(),
                source: std::io::Error::other(e),
            })?
    }

    /// Stop the flusher and write pending state. Returns `false` if the
    /// final write failed; always `true` without persistence.
    pub async fn shutdown(mut self) -> bool {
        match self.flusher.take() {
            Some(flusher) => flusher.shutdown().await,
            None => true,
        }
    }

    fn mark_dirty(&self) {
        if let Some(flusher) = &self.flusher {
            flusher.mark_dirty();
        }
    }

    async fn note_profile(&self, profile: &ModelContextProfile) {
        let mut last = self.last_profile.lock().await;
        if let Some(previous) = *last
            && previous != *profile
        {
            info!(
                "task {}: model context changed ({} -> {} safe tokens); keeping prior elisions",
                self.task_id,
                previous.safe_budget(),
                profile.safe_budget()
            );
        }
        *last = Some(*profile);
    }
}

/// Tell the model that part of the conversation was removed. The note goes
/// on the first block of message 0, which is never elided.
fn record_truncation_note(
    store: &mut ContextStore,
    raw: &[Message],
    range: TruncationRange,
) -> Result<(), ContextError> {
    if raw.first().is_none_or(|m| m.blocks.is_empty()) {
        return Ok(());
    }
    store.record_update(
        0,
        0,
        UpdateType::Note,
        truncation_note(range),
        chrono::Utc::now().timestamp_millis(),
    )
}

fn truncation_note(range: TruncationRange) -> String {
    format!(
        "[Note: messages {} through {} were removed to fit the context window.]",
        range.start, range.end
    )
}
