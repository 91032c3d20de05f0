//! Pub/sub transports between contexts
//!
//! Two interchangeable implementations:
//! - [`ChannelTransport`]: direct in-process channel shared through a [`ChannelHub`]
//! - [`SharedStorageTransport`]: fallback that writes the message to a key of a
//!   [`SharedStorageArea`] and clears it at once; receivers react to the
//!   change notification

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use prefsync_core::{ContextMessage, SyncError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Key the fallback transport writes messages to
pub const BROADCAST_KEY: &str = "prefsync_broadcast";

const CHANNEL_CAPACITY: usize = 256;

/// Publishes and receives context messages
pub trait Transport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &'static str;

    /// Send a message to every subscriber, the sender's own included
    ///
    /// # Errors
    /// [`SyncError::Closed`] after [`Transport::close`], or an encoding failure
    fn publish(&self, message: &ContextMessage) -> Result<(), SyncError>;

    /// Stream of messages published after this call
    fn subscribe(&self) -> BoxStream<'static, ContextMessage>;

    /// Stop publishing
    fn close(&self);
}

fn receiver_stream<T, U, F>(receiver: broadcast::Receiver<T>, map: F) -> BoxStream<'static, U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Option<U> + Send + Sync + 'static,
{
    let map = Arc::new(map);
    stream::unfold(receiver, move |mut receiver| {
        let map = Arc::clone(&map);
        async move {
            loop {
                match receiver.recv().await {
                    Ok(item) => {
                        if let Some(mapped) = map(item) {
                            return Some((mapped, receiver));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "context message receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    })
    .boxed()
}

/// Named channel shared by every context of one session
#[derive(Debug, Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<ContextMessage>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    /// Create hub
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Transport endpoint for one context
    #[must_use]
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport {
            sender: self.sender.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

/// Direct channel transport
#[derive(Debug)]
pub struct ChannelTransport {
    sender: broadcast::Sender<ContextMessage>,
    closed: AtomicBool,
}

impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn publish(&self, message: &ContextMessage) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        // No receivers is not an error: no other context is open
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, ContextMessage> {
        receiver_stream(self.sender.subscribe(), Some)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Change notification of a [`SharedStorageArea`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Changed key
    pub key: String,
    /// New value; `None` when the key was removed
    pub new_value: Option<String>,
}

/// String key/value area shared by every context, with change notifications
#[derive(Debug)]
pub struct SharedStorageArea {
    items: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for SharedStorageArea {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorageArea {
    /// Create empty area
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            items: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Current value of `key`
    #[must_use]
    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    /// Write `key` and notify
    pub fn set_item(&self, key: &str, value: String) {
        self.items.lock().insert(key.to_string(), value.clone());
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value: Some(value),
        });
    }

    /// Remove `key` and notify
    pub fn remove_item(&self, key: &str) {
        self.items.lock().remove(key);
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value: None,
        });
    }

    /// Change notifications from now on
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// Fallback transport over a shared storage area
#[derive(Debug)]
pub struct SharedStorageTransport {
    area: Arc<SharedStorageArea>,
    closed: AtomicBool,
}

impl SharedStorageTransport {
    /// Create transport over `area`
    #[must_use]
    pub fn new(area: Arc<SharedStorageArea>) -> Self {
        Self {
            area,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for SharedStorageTransport {
    fn name(&self) -> &'static str {
        "shared-storage"
    }

    fn publish(&self, message: &ContextMessage) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let encoded =
            serde_json::to_string(message).map_err(|e| SyncError::Protocol(e.to_string()))?;
        self.area.set_item(BROADCAST_KEY, encoded);
        self.area.remove_item(BROADCAST_KEY);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, ContextMessage> {
        receiver_stream(self.area.events(), |event: StorageEvent| {
            if event.key != BROADCAST_KEY {
                return None;
            }
            let raw = event.new_value?;
            match serde_json::from_str::<ContextMessage>(&raw) {
                Ok(message) => Some(message),
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable context message");
                    None
                }
            }
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Pick the direct channel when one is available, else the shared-storage fallback
#[must_use]
pub fn select_transport(
    hub: Option<&ChannelHub>,
    fallback: &Arc<SharedStorageArea>,
) -> Arc<dyn Transport> {
    match hub {
        Some(hub) => Arc::new(hub.transport()),
        None => {
            tracing::info!("direct channel unavailable, using shared-storage transport");
            Arc::new(SharedStorageTransport::new(Arc::clone(fallback)))
        }
    }
}
