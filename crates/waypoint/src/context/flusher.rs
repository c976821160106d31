//! Debounced background flush and periodic prune for one task's context.
//!
//! A [`ContextFlusher`] owns a single tokio task. Mutations call
//! [`mark_dirty`](ContextFlusher::mark_dirty); once no further mutation has
//! arrived for `flush_debounce`, the task snapshots the store under its lock
//! and writes the snapshot on a blocking thread. Flushes are serialized by a
//! write lock taken before the snapshot, so an older snapshot can never land
//! after a newer one. Pruning runs on its own
//! interval inside the same task, so flush and prune are always sequential.
//!
//! A failed write is retried once and then logged. The in-memory store stays
//! authoritative and is re-marked dirty, so the next flush tries again.
//! [`shutdown`](ContextFlusher::shutdown) stops the task and performs a final
//! flush.

use crate::config::ContextConfig;
use crate::context::persist::{ContextPersistence, ContextSnapshot};
use crate::context::store::ContextStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Handle to a task's background flusher.
pub struct ContextFlusher {
    store: Arc<Mutex<ContextStore>>,
    persistence: Arc<dyn ContextPersistence>,
    task_id: String,
    notify: Arc<Notify>,
    write_lock: Arc<Mutex<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ContextFlusher {
    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<Mutex<ContextStore>>,
        persistence: Arc<dyn ContextPersistence>,
        task_id: impl Into<String>,
        config: &ContextConfig,
    ) -> Self {
        let task_id = task_id.into();
        let notify = Arc::new(Notify::new());
        let write_lock = Arc::new(Mutex::new(()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(run(
            store.clone(),
            persistence.clone(),
            task_id.clone(),
            notify.clone(),
            write_lock.clone(),
            shutdown_rx,
            Timing::from(config),
        ));

        Self {
            store,
            persistence,
            task_id,
            notify,
            write_lock,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Restart the debounce window. Coalesces with pending notifications.
    pub fn mark_dirty(&self) {
        self.notify.notify_one();
    }

    /// Flush immediately, bypassing the debounce. Returns `false` if both
    /// write attempts failed.
    pub async fn flush_now(&self) -> bool {
        flush(&self.store, &self.persistence, &self.write_lock, &self.task_id).await
    }

    /// Stop the background task and write any pending state.
    pub async fn shutdown(mut self) -> bool {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("context flusher for task {} ended abnormally: {e}", self.task_id);
        }
        flush(&self.store, &self.persistence, &self.write_lock, &self.task_id).await
    }
}

impl Drop for ContextFlusher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    debounce: Duration,
    prune_interval: Duration,
    prune_max_age: Duration,
}

impl From<&ContextConfig> for Timing {
    fn from(config: &ContextConfig) -> Self {
        Self {
            debounce: config.flush_debounce,
            prune_interval: config.prune_interval.max(Duration::from_millis(1)),
            prune_max_age: config.prune_max_age,
        }
    }
}

async fn run(
    store: Arc<Mutex<ContextStore>>,
    persistence: Arc<dyn ContextPersistence>,
    task_id: String,
    notify: Arc<Notify>,
    write_lock: Arc<Mutex<()>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    timing: Timing,
) {
    let mut prune_tick =
        tokio::time::interval_at(Instant::now() + timing.prune_interval, timing.prune_interval);
    prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return,
            _ = notify.notified() => {
                // Wait for a quiet period before writing.
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => return,
                        _ = notify.notified() => continue,
                        _ = tokio::time::sleep(timing.debounce) => break,
                    }
                }
                flush(&store, &persistence, &write_lock, &task_id).await;
            }
            _ = prune_tick.tick() => {
                prune(&store, &task_id, timing.prune_max_age).await;
            }
        }
    }
}

/// Snapshot under the lock, write off the runtime, retry once.
async fn flush(
    store: &Arc<Mutex<ContextStore>>,
    persistence: &Arc<dyn ContextPersistence>,
    write_lock: &Mutex<()>,
    task_id: &str,
) -> bool {
    let _writing = write_lock.lock().await;
    let snapshot = {
        let mut store = store.lock().await;
        if !store.take_dirty() {
            return true;
        }
        ContextSnapshot::new(store.snapshot())
    };

    for attempt in 1..=2 {
        let persistence = persistence.clone();
        let id = task_id.to_string();
        let snap = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || persistence.save_context(&id, &snap)).await;
        match result {
            Ok(Ok(())) => {
                debug!(
                    "flushed context for task {task_id} ({} overlay updates)",
                    snapshot.state.overlay.len()
                );
                return true;
            }
            Ok(Err(e)) => warn!("context flush for task {task_id} failed (attempt {attempt}/2): {e}"),
            Err(e) => warn!("context flush for task {task_id} panicked (attempt {attempt}/2): {e}"),
        }
    }

    warn!("giving up on context flush for task {task_id}; in-memory state remains authoritative");
    store.lock().await.mark_dirty();
    false
}

async fn prune(store: &Arc<Mutex<ContextStore>>, task_id: &str, max_age: Duration) {
    let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    let cutoff = chrono::Utc::now()
        .timestamp_millis()
        .saturating_sub(max_age_ms);
    let removed = store.lock().await.prune_older_than(cutoff);
    if removed > 0 {
        debug!("pruned {removed} superseded overlay updates for task {task_id}");
    }
}
