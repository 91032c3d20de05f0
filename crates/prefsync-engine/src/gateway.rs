//! Persistence gateway and retry queue
//!
//! Delivers batches to the backend and owns the retry queue:
//! - One round-trip per send, bounded by the request timeout
//! - Validation failures are rejected without retrying
//! - Retryable failures are queued with exponential backoff until
//!   `max_retries` is exhausted, then surfaced as terminal
//! - Going offline pauses retries; coming back online sweeps the whole
//!   queue, oldest first

use crate::backend::{BackendRequest, SettingsBackend};
use crate::guard::isolated;
use crate::stats::StatsRecorder;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use prefsync_core::{
    Batch, PendingChange, ScheduledTask, SettingStore, SettingsMap, SyncConfig, SyncError,
    TaskScheduler,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;

/// Reacts to the fate of delivered changes
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    /// Changes confirmed by the backend
    async fn on_committed(&self, _entries: &[PendingChange]) {}

    /// Changes refused without retry
    async fn on_rejected(&self, _entries: &[PendingChange], _error: &SyncError) {}

    /// Changes dropped after exhausting their retries
    async fn on_exhausted(&self, _entries: &[PendingChange], _error: &SyncError) {}
}

/// What happened to each key of one delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Confirmed keys
    pub committed: Vec<String>,
    /// Keys waiting in the retry queue
    pub queued: Vec<String>,
    /// Keys refused as invalid
    pub rejected: Vec<String>,
    /// Keys whose retries ran out
    pub exhausted: Vec<String>,
    /// Failure of the round-trip, if any
    pub error: Option<SyncError>,
}

impl DeliveryReport {
    /// Every key was committed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.queued.is_empty() && self.rejected.is_empty() && self.exhausted.is_empty()
    }

    /// Nothing was delivered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
            && self.queued.is_empty()
            && self.rejected.is_empty()
            && self.exhausted.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.committed.extend(other.committed);
        self.queued.extend(other.queued);
        self.rejected.extend(other.rejected);
        self.exhausted.extend(other.exhausted);
        if other.error.is_some() {
            self.error = other.error;
        }
    }
}

/// Unacknowledged changes awaiting another attempt, at most one per key
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    entries: Vec<PendingChange>,
}

impl RetryQueue {
    /// Create empty queue
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change, keeping the newer revision when the key is already queued
    pub fn upsert(&mut self, mut change: PendingChange) {
        match self.entries.iter_mut().find(|e| e.key == change.key) {
            Some(existing) if existing.revision > change.revision => {}
            Some(existing) => {
                change.enqueued_at = change.enqueued_at.min(existing.enqueued_at);
                *existing = change;
            }
            None => self.entries.push(change),
        }
    }

    /// Drop entries superseded by a committed revision
    pub fn remove_committed(&mut self, committed: &[PendingChange]) {
        self.entries.retain(|e| {
            !committed
                .iter()
                .any(|c| c.key == e.key && c.revision >= e.revision)
        });
    }

    /// Drop the entry for `key`; returns whether one was queued
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        self.entries.len() != before
    }

    /// Remove entries due at `now`, oldest first
    pub fn take_due(&mut self, now: Instant) -> Vec<PendingChange> {
        let (mut due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.next_retry_at <= now);
        self.entries = rest;
        due.sort_by_key(|e| e.enqueued_at);
        due
    }

    /// Remove every entry, oldest first
    pub fn take_all(&mut self) -> Vec<PendingChange> {
        let mut all = std::mem::take(&mut self.entries);
        all.sort_by_key(|e| e.enqueued_at);
        all
    }

    /// Earliest scheduled retry
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_retry_at).min()
    }

    /// Queued keys
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Queued entry for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PendingChange> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Number of queued entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if queue is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Delivers batches and drives retries
pub struct PersistenceGateway {
    backend: Arc<dyn SettingsBackend>,
    store: Arc<SettingStore>,
    timer: Arc<dyn TaskScheduler>,
    config: SyncConfig,
    auth_token: String,
    queue: Mutex<RetryQueue>,
    retry_task: Mutex<Option<ScheduledTask>>,
    sweeping: tokio::sync::Mutex<()>,
    online: AtomicBool,
    closed: AtomicBool,
    observers: RwLock<Vec<Arc<dyn DeliveryObserver>>>,
    stats: Arc<StatsRecorder>,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("queued", &self.queue.lock().len())
            .field("online", &self.is_online())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PersistenceGateway {
    /// Create gateway
    #[must_use]
    pub fn new(
        backend: Arc<dyn SettingsBackend>,
        store: Arc<SettingStore>,
        timer: Arc<dyn TaskScheduler>,
        config: SyncConfig,
        auth_token: impl Into<String>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            backend,
            store,
            timer,
            config,
            auth_token: auth_token.into(),
            queue: Mutex::new(RetryQueue::new()),
            retry_task: Mutex::new(None),
            sweeping: tokio::sync::Mutex::new(()),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            stats,
        }
    }

    /// Register an observer
    pub fn add_observer(&self, observer: Arc<dyn DeliveryObserver>) {
        self.observers.write().push(observer);
    }

    /// Backend used for every call
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SettingsBackend> {
        &self.backend
    }

    /// Credential sent with every call
    #[inline]
    #[must_use]
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// One save round-trip; returns the keys the backend acknowledged
    ///
    /// A response without `data` acknowledges the whole batch.
    ///
    /// # Errors
    /// Classified failure of the round-trip
    pub async fn send(&self, batch: &Batch) -> Result<SettingsMap, SyncError> {
        let request = BackendRequest::save(batch.key_values(), self.auth_token.clone());
        self.stats.batch_sent();
        tracing::debug!(batch = %batch.id, keys = batch.len(), "sending batch");

        let response = isolated(self.config.request_timeout(), self.backend.call(request)).await?;
        let acked = response.into_result()?;
        Ok(acked.unwrap_or_else(|| batch.key_values()))
    }

    /// Send a batch and settle every entry: commit, queue, reject or exhaust
    pub async fn deliver(self: &Arc<Self>, batch: Batch) -> DeliveryReport {
        if batch.is_empty() {
            return DeliveryReport::default();
        }
        if !self.is_online() {
            tracing::debug!(keys = batch.len(), "offline, parking batch in retry queue");
            return self.park(batch.into_entries());
        }
        let result = self.send(&batch).await;
        let report = self.settle(batch.into_entries(), result).await;
        self.arm_retry_timer();
        report
    }

    /// Retry queued entries; `force` ignores their scheduled times
    pub async fn sweep(self: &Arc<Self>, force: bool) -> DeliveryReport {
        let _guard = self.sweeping.lock().await;
        if !self.is_online() || self.closed.load(Ordering::Acquire) {
            return DeliveryReport::default();
        }

        let entries = {
            let mut queue = self.queue.lock();
            if force {
                queue.take_all()
            } else {
                queue.take_due(self.timer.now())
            }
        };
        if entries.is_empty() {
            self.arm_retry_timer();
            return DeliveryReport::default();
        }

        tracing::info!(entries = entries.len(), force, "sweeping retry queue");
        let batch = Batch::from_changes(entries.clone());
        let result = self.send(&batch).await;
        let report = self.settle(entries, result).await;
        self.arm_retry_timer();
        report
    }

    /// Pause or resume retries; resuming sweeps the whole queue at once
    pub async fn set_online(self: &Arc<Self>, online: bool) -> DeliveryReport {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if !online {
            if let Some(task) = self.retry_task.lock().take() {
                task.cancel();
            }
            tracing::info!(queued = self.queue_len(), "offline, retries paused");
            return DeliveryReport::default();
        }
        if was_online {
            return DeliveryReport::default();
        }
        tracing::info!(queued = self.queue_len(), "back online, sweeping retry queue");
        self.sweep(true).await
    }

    /// Whether the backend is considered reachable
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Number of queued entries
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Copy of the retry queue
    #[must_use]
    pub fn queue_snapshot(&self) -> RetryQueue {
        self.queue.lock().clone()
    }

    /// Forget the queued write for `key` after a newer value arrived from elsewhere
    ///
    /// Returns whether an entry was dropped.
    pub fn supersede(&self, key: &str) -> bool {
        let dropped = self.queue.lock().remove(key);
        if dropped {
            tracing::debug!(key, "queued write superseded");
        }
        dropped
    }

    /// Drop every queued entry; returns how many were dropped
    pub fn discard_queued(&self) -> usize {
        let dropped = self.queue.lock().take_all().len();
        if let Some(task) = self.retry_task.lock().take() {
            task.cancel();
        }
        dropped
    }

    /// Stop retrying; queued entries stay in the store as unsaved edits
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.retry_task.lock().take() {
            task.cancel();
        }
    }

    fn park(&self, entries: Vec<PendingChange>) -> DeliveryReport {
        let now = self.timer.now();
        let mut queue = self.queue.lock();
        let mut report = DeliveryReport::default();
        for mut entry in entries {
            entry.next_retry_at = now;
            report.queued.push(entry.key.clone());
            queue.upsert(entry);
        }
        report
    }

    async fn settle(
        self: &Arc<Self>,
        entries: Vec<PendingChange>,
        result: Result<SettingsMap, SyncError>,
    ) -> DeliveryReport {
        match result {
            Ok(acked) => {
                let (committed, unacked): (Vec<_>, Vec<_>) = entries
                    .into_iter()
                    .partition(|e| acked.contains_key(&e.key));
                let mut report = self.commit(committed).await;
                if !unacked.is_empty() {
                    let error = SyncError::Protocol("keys missing from acknowledgement".to_string());
                    report.merge(self.record_failure(unacked, error).await);
                }
                report
            }
            Err(error) if !error.is_retryable() => self.reject(entries, error).await,
            Err(error) => self.record_failure(entries, error).await,
        }
    }

    async fn commit(&self, committed: Vec<PendingChange>) -> DeliveryReport {
        if committed.is_empty() {
            return DeliveryReport::default();
        }
        self.queue.lock().remove_committed(&committed);
        let cleared = self
            .store
            .acknowledge(committed.iter().map(|e| (e.key.as_str(), e.revision)));
        self.stats.keys_committed(committed.len());
        tracing::debug!(keys = committed.len(), cleared = cleared.len(), "batch committed");

        let mut report = DeliveryReport {
            committed: committed.iter().map(|e| e.key.clone()).collect(),
            ..DeliveryReport::default()
        };
        // Only values still current in the store are announced
        let (current, stale): (Vec<_>, Vec<_>) = committed
            .into_iter()
            .partition(|e| self.store.revision(&e.key) == Some(e.revision));
        report.queued = self.resubmit_overwritten(stale);

        if !current.is_empty() {
            for observer in self.observers() {
                observer.on_committed(&current).await;
            }
        }
        report
    }

    /// Re-send keys whose committed value was replaced by a sibling's value
    /// before the acknowledgement came back
    ///
    /// The backend now holds the older value, so the store's value goes out
    /// again. Keys with a newer unsaved local edit are left to the scheduler.
    fn resubmit_overwritten(&self, stale: Vec<PendingChange>) -> Vec<String> {
        let now = self.timer.now();
        let mut requeued = Vec::new();
        let mut queue = self.queue.lock();
        for entry in stale {
            if self.store.is_unsaved(&entry.key)
                || self.store.get(&entry.key).as_ref() == Some(&entry.value)
            {
                continue;
            }
            let Some(mut change) = self.store.resubmit(&entry.key) else {
                continue;
            };
            tracing::info!(key = %entry.key, "backend overwritten by a stale write, resending current value");
            change.next_retry_at = now;
            requeued.push(change.key.clone());
            queue.upsert(change);
        }
        requeued
    }

    async fn reject(&self, entries: Vec<PendingChange>, error: SyncError) -> DeliveryReport {
        tracing::warn!(keys = entries.len(), %error, "batch rejected");
        self.stats.validation_rejected();
        for observer in self.observers() {
            observer.on_rejected(&entries, &error).await;
        }
        DeliveryReport {
            rejected: entries.into_iter().map(|e| e.key).collect(),
            error: Some(error),
            ..DeliveryReport::default()
        }
    }

    async fn record_failure(&self, entries: Vec<PendingChange>, error: SyncError) -> DeliveryReport {
        let now = self.timer.now();
        let mut report = DeliveryReport {
            error: Some(error.clone()),
            ..DeliveryReport::default()
        };
        let mut exhausted = Vec::new();
        {
            let mut queue = self.queue.lock();
            for mut entry in entries {
                if !self.store.is_unsaved(&entry.key) {
                    tracing::debug!(key = %entry.key, "failed write already superseded, dropping");
                    continue;
                }
                entry.attempts += 1;
                if entry.attempts > self.config.max_retries {
                    exhausted.push(entry);
                    continue;
                }
                entry.next_retry_at = now + self.config.retry_delay(entry.attempts);
                tracing::debug!(
                    key = %entry.key,
                    attempts = entry.attempts,
                    delay_ms = self.config.retry_delay(entry.attempts).as_millis() as u64,
                    "retry scheduled"
                );
                report.queued.push(entry.key.clone());
                queue.upsert(entry);
            }
        }
        self.stats.retries_scheduled(report.queued.len());

        if !exhausted.is_empty() {
            tracing::error!(keys = exhausted.len(), %error, "retries exhausted");
            self.stats.terminal_failures(exhausted.len());
            self.store.mark_dirty(exhausted.iter().map(|e| e.key.as_str()));
            for observer in self.observers() {
                observer.on_exhausted(&exhausted, &error).await;
            }
            report.exhausted = exhausted.into_iter().map(|e| e.key).collect();
        }
        report
    }

    fn arm_retry_timer(self: &Arc<Self>) {
        if !self.is_online() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(due) = self.queue.lock().next_due() else {
            if let Some(task) = self.retry_task.lock().take() {
                task.cancel();
            }
            return;
        };
        let delay = due.saturating_duration_since(self.timer.now());
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = self.timer.schedule(
            delay,
            async move {
                if let Some(gateway) = weak.upgrade() {
                    // Detach our own handle so re-arming never aborts this run
                    drop(gateway.retry_task.lock().take());
                    let _ = gateway.sweep(false).await;
                }
            }
            .boxed(),
        );
        if let Some(previous) = self.retry_task.lock().replace(task) {
            previous.cancel();
        }
    }

    fn observers(&self) -> Vec<Arc<dyn DeliveryObserver>> {
        self.observers.read().clone()
    }

    /// Keys currently in the retry queue
    #[must_use]
    pub fn queued_keys(&self) -> HashSet<String> {
        self.queue.lock().keys().into_iter().collect()
    }
}
