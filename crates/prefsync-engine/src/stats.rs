//! Sync statistics for monitoring
//!
//! Counters are updated lock-free from every component and read as a
//! [`SyncStats`] snapshot.

use parking_lot::Mutex;
use prefsync_core::SourceTier;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Batches handed to the backend (first attempts and retries)
    pub batches_sent: u64,
    /// Keys confirmed by the backend
    pub keys_committed: u64,
    /// Entries pushed onto the retry queue
    pub retries_scheduled: u64,
    /// Entries dropped after exhausting their retries
    pub terminal_failures: u64,
    /// Edits or batches refused as invalid
    pub validation_rejections: u64,
    /// Messages published to sibling contexts
    pub broadcasts_sent: u64,
    /// Messages from sibling contexts applied locally
    pub broadcasts_applied: u64,
    /// Own messages observed and ignored
    pub echoes_suppressed: u64,
    /// Acks received for broadcasts
    pub acks_received: u64,
    /// Tier that hydrated the store at startup
    pub startup_tier: Option<SourceTier>,
}

/// Shared counters behind [`SyncStats`]
#[derive(Debug, Default)]
pub struct StatsRecorder {
    batches_sent: AtomicU64,
    keys_committed: AtomicU64,
    retries_scheduled: AtomicU64,
    terminal_failures: AtomicU64,
    validation_rejections: AtomicU64,
    broadcasts_sent: AtomicU64,
    broadcasts_applied: AtomicU64,
    echoes_suppressed: AtomicU64,
    acks_received: AtomicU64,
    startup_tier: Mutex<Option<SourceTier>>,
}

impl StatsRecorder {
    /// Create zeroed recorder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn keys_committed(&self, count: usize) {
        self.keys_committed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn retries_scheduled(&self, count: usize) {
        self.retries_scheduled.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn terminal_failures(&self, count: usize) {
        self.terminal_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn validation_rejected(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn broadcast_sent(&self) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn broadcast_applied(&self) {
        self.broadcasts_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn echo_suppressed(&self) {
        self.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_startup_tier(&self, tier: Option<SourceTier>) {
        *self.startup_tier.lock() = tier;
    }

    /// Read all counters
    #[must_use]
    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            keys_committed: self.keys_committed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            broadcasts_applied: self.broadcasts_applied.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            startup_tier: *self.startup_tier.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = StatsRecorder::new();
        stats.batch_sent();
        stats.batch_sent();
        stats.keys_committed(3);
        stats.echo_suppressed();
        stats.set_startup_tier(Some(SourceTier::Session));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_sent, 2);
        assert_eq!(snapshot.keys_committed, 3);
        assert_eq!(snapshot.echoes_suppressed, 1);
        assert_eq!(snapshot.startup_tier, Some(SourceTier::Session));
        assert_eq!(snapshot.terminal_failures, 0);
    }
}
