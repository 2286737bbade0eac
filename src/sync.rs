//! Write-back flushing and the background loops that drive it.

use crate::cache::MessageLog;
use crate::db::Store;
use crate::engine::Repeater;
use crate::error::{RepeaterError, Result};
use crate::index::ContextIndex;
use crate::moderation::Moderation;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub contexts: usize,
    pub blacklists: usize,
    pub messages: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.contexts == 0 && self.blacklists == 0 && self.messages == 0
    }
}

/// Moves buffered generations into the store.
///
/// Flushes are serialized; writers are only blocked while a generation is
/// swapped out, never during the store write.
pub struct SyncController {
    store: Arc<dyn Store>,
    flush_lock: Mutex<()>,
}

impl SyncController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Writes contexts, then blacklists, then messages. A failed stage puts
    /// its generation back for the next attempt; the other stages still run.
    pub async fn flush(
        &self,
        index: &ContextIndex,
        log: &MessageLog,
        moderation: &Moderation,
    ) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();
        let mut failures = Vec::new();

        let deltas = index.take_pending();
        if !deltas.is_empty() {
            match self.store.merge_contexts(&deltas).await {
                Ok(()) => report.contexts = deltas.len(),
                Err(e) => {
                    warn!("Flush: {} context deltas kept for retry: {}", deltas.len(), e);
                    index.restore_pending(deltas);
                    failures.push(format!("contexts: {}", e));
                }
            }
        }

        let lists = moderation.take_dirty();
        if !lists.is_empty() {
            match self.store.save_blacklists(&lists).await {
                Ok(()) => {
                    moderation.confirm_saved(&lists);
                    report.blacklists = lists.len();
                }
                Err(e) => {
                    warn!("Flush: {} blacklists kept for retry: {}", lists.len(), e);
                    moderation.restore_dirty(&lists);
                    failures.push(format!("blacklists: {}", e));
                }
            }
        }

        let messages = log.take_pending();
        if !messages.is_empty() {
            match self.store.append_messages(&messages).await {
                Ok(()) => report.messages = messages.len(),
                Err(e) => {
                    warn!("Flush: {} messages kept for retry: {}", messages.len(), e);
                    log.restore_pending(messages);
                    failures.push(format!("messages: {}", e));
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(RepeaterError::StoreUnavailable(failures.join("; ")))
        }
    }
}

/// Handles for the background loops started by [`Repeater::spawn_background`].
pub struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    pub(crate) fn new(shutdown: watch::Sender<bool>, handles: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, handles }
    }

    /// Stops the loops between ticks and waits for them; an in-flight flush
    /// finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
    }
}

pub struct FlushScheduler {
    engine: Arc<Repeater>,
    interval: Duration,
}

impl FlushScheduler {
    pub fn new(engine: Arc<Repeater>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(
            "Flush scheduler: every {}",
            humantime::format_duration(self.interval)
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.engine.flush_now().await {
                Ok(report) if report.is_empty() => debug!("Flush scheduler: nothing to flush"),
                Ok(report) => info!(
                    "Flush scheduler: wrote {} contexts, {} blacklists, {} messages",
                    report.contexts, report.blacklists, report.messages
                ),
                Err(e) => error!("Flush scheduler: flush failed, will retry: {}", e),
            }
        }
        debug!("Flush scheduler stopped");
    }
}

/// Periodically re-reads every group's blacklist to pick up changes made
/// outside this process.
pub struct BlacklistRefresher {
    engine: Arc<Repeater>,
    interval: Duration,
}

impl BlacklistRefresher {
    pub fn new(engine: Arc<Repeater>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.engine.hydrate_global_blacklist().await {
                error!("Blacklist refresh failed: {}", e);
            }
        }
        debug!("Blacklist refresher stopped");
    }
}
