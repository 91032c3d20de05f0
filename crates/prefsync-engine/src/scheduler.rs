//! Batch scheduler
//!
//! Coalesces bursts of edits into infrequent backend writes. Two cancellable
//! timers gate every write:
//! - a per-key debounce timer, restarted by every edit of that key
//! - a global flush timer, started on demand
//!
//! A flush collects every dirty key whose debounce window has closed, hands
//! them to the gateway as one batch, and clears their dirty markers
//! optimistically. Concurrent flushes join the one already in flight.

use crate::gateway::{DeliveryReport, PersistenceGateway};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use prefsync_core::{Batch, ScheduledTask, SettingStore, SyncConfig, TaskScheduler};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Result of one flush
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was dirty
    Empty,
    /// A batch went to the gateway
    Delivered(DeliveryReport),
}

impl FlushOutcome {
    /// Delivery report, if a batch was sent
    #[must_use]
    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            Self::Empty => None,
            Self::Delivered(report) => Some(report),
        }
    }
}

type InFlight = Shared<BoxFuture<'static, FlushOutcome>>;

/// Debounces edits and assembles write batches
pub struct BatchScheduler {
    store: Arc<SettingStore>,
    gateway: Arc<PersistenceGateway>,
    timer: Arc<dyn TaskScheduler>,
    config: SyncConfig,
    debouncing: DashMap<String, (u64, ScheduledTask)>,
    generation: AtomicU64,
    flush_task: Mutex<Option<ScheduledTask>>,
    in_flight: Mutex<Option<InFlight>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("debouncing", &self.debouncing.len())
            .field("flush_armed", &self.flush_task.lock().is_some())
            .field("in_flight", &self.in_flight.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Create scheduler
    #[must_use]
    pub fn new(
        store: Arc<SettingStore>,
        gateway: Arc<PersistenceGateway>,
        timer: Arc<dyn TaskScheduler>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            timer,
            config,
            debouncing: DashMap::new(),
            generation: AtomicU64::new(0),
            flush_task: Mutex::new(None),
            in_flight: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Note an edit of `key`: restart its debounce window and make sure a flush is coming
    pub fn enqueue(self: &Arc<Self>, key: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.debounce_for(key);
        let weak: Weak<Self> = Arc::downgrade(self);
        let owned = key.to_string();
        let task = self.timer.schedule(
            delay,
            async move {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.debounce_settled(&owned, generation);
                }
            }
            .boxed(),
        );

        if let Some((_, (_, previous))) = self.debouncing.remove(key) {
            previous.cancel();
        }
        self.debouncing.insert(key.to_string(), (generation, task));
        tracing::trace!(key, delay_ms = delay.as_millis() as u64, "debounce restarted");
        self.ensure_flush_timer();
    }

    fn debounce_settled(self: &Arc<Self>, key: &str, generation: u64) {
        let removed = self
            .debouncing
            .remove_if(key, |_, (current, _)| *current == generation)
            .is_some();
        if removed {
            self.ensure_flush_timer();
        }
    }

    fn ensure_flush_timer(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.flush_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(self.timer.schedule(
            self.config.flush_interval(),
            async move {
                if let Some(scheduler) = weak.upgrade() {
                    drop(scheduler.flush_task.lock().take());
                    let _ = scheduler.flush().await;
                }
            }
            .boxed(),
        ));
    }

    /// Flush every settled dirty key; joins a flush already in flight
    pub async fn flush(self: &Arc<Self>) -> FlushOutcome {
        let shared = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let this = Arc::clone(self);
                    let future = async move {
                        let outcome = this.run_flush().await;
                        *this.in_flight.lock() = None;
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        shared.await
    }

    /// Cancel all debounce windows and flush everything dirty
    pub async fn flush_all(self: &Arc<Self>) -> Vec<FlushOutcome> {
        self.cancel_timers();
        let mut outcomes = vec![self.flush().await];
        // The first call may have joined a flush that started before these edits
        if !self.store.dirty_keys().is_empty() {
            outcomes.push(self.flush().await);
        }
        outcomes
    }

    async fn run_flush(&self) -> FlushOutcome {
        let entries = self.store.take_dirty(|key| self.debouncing.contains_key(key));
        if entries.is_empty() {
            return FlushOutcome::Empty;
        }
        let batch = Batch::from_changes(entries);
        tracing::info!(batch = %batch.id, keys = batch.len(), "flushing batch");
        FlushOutcome::Delivered(self.gateway.deliver(batch).await)
    }

    /// Keys inside an open debounce window
    #[must_use]
    pub fn debouncing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.debouncing.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Whether a flush timer is pending
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.flush_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting edits and cancel all timers
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_timers();
    }

    fn cancel_timers(&self) {
        let keys: Vec<String> = self.debouncing.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, (_, task))) = self.debouncing.remove(&key) {
                task.cancel();
            }
        }
        if let Some(task) = self.flush_task.lock().take() {
            task.cancel();
        }
    }
}
