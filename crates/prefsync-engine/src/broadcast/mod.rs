//! Cross-context broadcaster
//!
//! Publishes committed changes to sibling contexts and applies theirs to the
//! local store. Every message carries the sender's [`ContextId`]; a context
//! never applies a message bearing its own id. Applied messages use
//! [`ChangeOrigin::Broadcast`], which does not mark the key dirty, so a
//! received change is never saved or broadcast again.

pub mod transport;

pub use transport::{
    select_transport, ChannelHub, ChannelTransport, SharedStorageArea, SharedStorageTransport,
    StorageEvent, Transport, BROADCAST_KEY,
};

use crate::gateway::DeliveryObserver;
use crate::stats::StatsRecorder;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use prefsync_core::{
    is_valid_key, ChangeOrigin, ContextId, ContextMessage, MessageKind, PendingChange,
    SettingStore, SettingValue, SyncError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// What the broadcaster did with a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Applied to the local store
    Applied,
    /// Our own message, ignored
    Echo,
    /// Acknowledgement, counted
    Ack,
    /// Not a valid setting key
    Ignored,
}

/// Propagates committed changes between contexts
pub struct Broadcaster {
    context_id: ContextId,
    transport: Arc<dyn Transport>,
    store: Arc<SettingStore>,
    stats: Arc<StatsRecorder>,
    acknowledge: bool,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("context_id", &self.context_id)
            .field("transport", &self.transport.name())
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Create broadcaster with a fresh context id
    #[must_use]
    pub fn new(
        store: Arc<SettingStore>,
        transport: Arc<dyn Transport>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            context_id: ContextId::new(),
            transport,
            store,
            stats,
            acknowledge: false,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Use a fixed context id
    #[inline]
    #[must_use]
    pub fn with_context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = context_id;
        self
    }

    /// Reply to received broadcasts with acks
    #[inline]
    #[must_use]
    pub fn with_acks(mut self, enabled: bool) -> Self {
        self.acknowledge = enabled;
        self
    }

    /// Identity of this context
    #[inline]
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Name of the transport in use
    #[inline]
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Publish a committed change
    ///
    /// # Errors
    /// [`SyncError::Closed`] after [`Broadcaster::close`], or a transport failure
    pub fn broadcast(&self, key: &str, value: SettingValue) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let message = ContextMessage::broadcast(key, value, self.context_id);
        self.transport.publish(&message)?;
        self.stats.broadcast_sent();
        tracing::debug!(key, context_id = %self.context_id, "broadcast published");
        Ok(())
    }

    /// Start applying messages from sibling contexts; idempotent
    pub fn start(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut messages = self.transport.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let Some(broadcaster) = weak.upgrade() else {
                    break;
                };
                broadcaster.receive(&message);
            }
        }));
        tracing::debug!(
            context_id = %self.context_id,
            transport = self.transport.name(),
            "broadcast listener started"
        );
    }

    /// Handle one received message
    pub fn receive(&self, message: &ContextMessage) -> Receipt {
        if message.is_from(self.context_id) {
            self.stats.echo_suppressed();
            return Receipt::Echo;
        }
        if message.kind == MessageKind::Ack {
            self.stats.ack_received();
            return Receipt::Ack;
        }
        if !is_valid_key(&message.key) {
            tracing::warn!(key = %message.key, "ignoring broadcast for reserved key");
            return Receipt::Ignored;
        }

        self.store
            .set(&message.key, message.value.clone(), ChangeOrigin::Broadcast);
        self.stats.broadcast_applied();
        tracing::debug!(
            key = %message.key,
            from = %message.source_context_id,
            "applied broadcast from sibling context"
        );

        if self.acknowledge {
            if let Err(error) = self.transport.publish(&message.ack(self.context_id)) {
                tracing::debug!(%error, "ack not sent");
            }
        }
        Receipt::Applied
    }

    /// Whether the listener task is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop listening and release the transport
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.transport.close();
        tracing::debug!(context_id = %self.context_id, "broadcaster closed");
    }
}

#[async_trait]
impl DeliveryObserver for Broadcaster {
    async fn on_committed(&self, entries: &[PendingChange]) {
        for entry in entries {
            if let Err(error) = self.broadcast(&entry.key, entry.value.clone()) {
                tracing::warn!(key = %entry.key, %error, "broadcast failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn context(transport: Arc<dyn Transport>) -> (Arc<SettingStore>, Arc<StatsRecorder>, Arc<Broadcaster>) {
        let store = Arc::new(SettingStore::new());
        let stats = Arc::new(StatsRecorder::new());
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&stats),
        ));
        (store, stats, broadcaster)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn own_message_is_an_echo() {
        let (store, stats, broadcaster) = context(Arc::new(ChannelHub::new().transport()));
        let message = ContextMessage::broadcast("width", json!(1), broadcaster.context_id());

        assert_eq!(broadcaster.receive(&message), Receipt::Echo);
        assert_eq!(store.get("width"), None);
        assert_eq!(stats.snapshot().echoes_suppressed, 1);
    }

    #[test]
    fn foreign_message_applies_without_marking_dirty() {
        let (store, _, broadcaster) = context(Arc::new(ChannelHub::new().transport()));
        let message = ContextMessage::broadcast("width", json!(200), ContextId::new());

        assert_eq!(broadcaster.receive(&message), Receipt::Applied);
        assert_eq!(store.get("width"), Some(json!(200)));
        assert!(store.dirty_keys().is_empty());
    }

    #[test]
    fn reserved_keys_are_ignored() {
        let (store, _, broadcaster) = context(Arc::new(ChannelHub::new().transport()));
        let message = ContextMessage::broadcast("_syncSource", json!("x"), ContextId::new());
        assert_eq!(broadcaster.receive(&message), Receipt::Ignored);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sibling_receives_and_acks() {
        let hub = ChannelHub::new();
        let (_, a_stats, a) = context(Arc::new(hub.transport()));
        let b_store = Arc::new(SettingStore::new());
        let b = Arc::new(
            Broadcaster::new(
                Arc::clone(&b_store),
                Arc::new(hub.transport()),
                Arc::new(StatsRecorder::new()),
            )
            .with_acks(true),
        );
        a.start();
        b.start();

        a.broadcast("width", json!(200)).unwrap();
        settle().await;

        assert_eq!(b_store.get("width"), Some(json!(200)));
        let stats = a_stats.snapshot();
        assert_eq!(stats.echoes_suppressed, 1);
        assert_eq!(stats.acks_received, 1);
    }

    #[tokio::test]
    async fn closed_broadcaster_stops() {
        let (_, _, broadcaster) = context(Arc::new(ChannelHub::new().transport()));
        broadcaster.start();
        assert!(broadcaster.is_listening());

        broadcaster.close();
        assert!(!broadcaster.is_listening());
        assert_eq!(broadcaster.broadcast("k", json!(1)), Err(SyncError::Closed));
    }
}
