//! In-memory setting store
//!
//! The single read path for consumers. Every tier, the backend and sibling
//! contexts synchronize *into* the store; nothing reads from them afterwards.
//!
//! Two markers are tracked per key:
//! - **dirty**: edited locally and not yet handed to a batch
//! - **unsaved**: edited locally and not yet confirmed by the backend
//!
//! A flush clears `dirty` optimistically; only a successful send clears
//! `unsaved`. Both carry the store revision of the edit so a late
//! acknowledgement never clears a newer edit.

use crate::types::{ChangeOrigin, PendingChange, Setting, SettingValue, SettingsMap};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A committed change, delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    /// Setting key
    pub key: String,
    /// New value
    pub value: SettingValue,
    /// Value before the change
    pub previous: Option<SettingValue>,
    /// Why the value changed
    pub origin: ChangeOrigin,
}

/// Subscription handle returned by [`SettingStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Debug, Default)]
struct StoreInner {
    settings: HashMap<String, Setting>,
    revisions: HashMap<String, u64>,
    dirty: BTreeSet<String>,
    unsaved: HashMap<String, u64>,
    revision: u64,
}

/// Single source of truth for current setting values
#[derive(Default)]
pub struct SettingStore {
    inner: RwLock<StoreInner>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for SettingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SettingStore")
            .field("settings", &inner.settings.len())
            .field("dirty", &inner.dirty.len())
            .field("unsaved", &inner.unsaved.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl SettingStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.inner.read().settings.get(key).map(|s| s.value.clone())
    }

    /// Full setting record for `key`
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<Setting> {
        self.inner.read().settings.get(key).cloned()
    }

    /// Update a value and notify subscribers
    ///
    /// Marks the key dirty and unsaved when the origin is a local edit or reset.
    pub fn set(&self, key: &str, value: SettingValue, origin: ChangeOrigin) -> StoreChange {
        let change = self.apply(key, value, origin);
        self.notify(std::slice::from_ref(&change));
        change
    }

    /// Bulk load without marking anything dirty
    pub fn hydrate(&self, values: &SettingsMap, origin: ChangeOrigin) -> Vec<StoreChange> {
        let changes: Vec<StoreChange> = values
            .iter()
            .map(|(key, value)| self.apply(key, value.clone(), origin))
            .collect();
        self.notify(&changes);
        changes
    }

    fn apply(&self, key: &str, value: SettingValue, origin: ChangeOrigin) -> StoreChange {
        let mut inner = self.inner.write();
        inner.revision += 1;
        let revision = inner.revision;

        let tier = origin.source_tier();
        let authoritative = matches!(origin, ChangeOrigin::RemoteAuthoritative);
        let previous = match inner.settings.get_mut(key) {
            Some(setting) => {
                let previous = std::mem::replace(&mut setting.value, value.clone());
                setting.source_tier = tier;
                setting.last_modified = Utc::now();
                setting.authoritative = authoritative;
                Some(previous)
            }
            None => {
                let mut setting = Setting::new(key, value.clone(), tier);
                setting.authoritative = authoritative;
                inner.settings.insert(key.to_string(), setting);
                None
            }
        };
        inner.revisions.insert(key.to_string(), revision);

        if origin.marks_dirty() {
            inner.dirty.insert(key.to_string());
            inner.unsaved.insert(key.to_string(), revision);
        } else if inner.unsaved.contains_key(key) {
            // A newer value from elsewhere replaces the unsaved local edit
            inner.dirty.remove(key);
            inner.unsaved.remove(key);
        }

        StoreChange {
            key: key.to_string(),
            value,
            previous,
            origin,
        }
    }

    /// Store revision of the latest change to `key`
    #[must_use]
    pub fn revision(&self, key: &str) -> Option<u64> {
        self.inner.read().revisions.get(key).copied()
    }

    /// Mark the current value of `key` unsaved again and return it as a pending change
    ///
    /// Used when the backend ended up holding an older value than this store.
    /// Returns `None` for unknown keys.
    pub fn resubmit(&self, key: &str) -> Option<PendingChange> {
        let mut inner = self.inner.write();
        let value = inner.settings.get(key)?.value.clone();
        let revision = inner.revisions.get(key).copied().unwrap_or_default();
        inner.unsaved.insert(key.to_string(), revision);
        Some(PendingChange::new(key, value, revision))
    }

    /// Drop every value without an unsaved local edit; returns the dropped keys
    ///
    /// Subscribers are not notified.
    pub fn evict_clean(&self) -> Vec<String> {
        let mut inner = self.inner.write();
        let StoreInner {
            settings,
            revisions,
            unsaved,
            ..
        } = &mut *inner;
        let mut evicted: Vec<String> = settings
            .keys()
            .filter(|k| !unsaved.contains_key(*k))
            .cloned()
            .collect();
        evicted.sort();
        for key in &evicted {
            settings.remove(key);
            revisions.remove(key);
        }
        evicted
    }

    /// Full copy of current values
    #[must_use]
    pub fn snapshot(&self) -> SettingsMap {
        self.inner
            .read()
            .settings
            .iter()
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Keys awaiting a flush
    #[must_use]
    pub fn dirty_keys(&self) -> Vec<String> {
        self.inner.read().dirty.iter().cloned().collect()
    }

    /// Remove dirty keys (except those `hold` keeps back) and return them as pending changes
    pub fn take_dirty(&self, hold: impl Fn(&str) -> bool) -> Vec<PendingChange> {
        let mut inner = self.inner.write();
        let ready: Vec<String> = inner.dirty.iter().filter(|k| !hold(k)).cloned().collect();

        let mut changes = Vec::with_capacity(ready.len());
        for key in ready {
            inner.dirty.remove(&key);
            let Some(setting) = inner.settings.get(&key) else {
                continue;
            };
            let revision = inner.revisions.get(&key).copied().unwrap_or_default();
            changes.push(PendingChange::new(key, setting.value.clone(), revision));
        }
        changes
    }

    /// Re-mark keys dirty after a terminal failure, skipping ones already confirmed
    pub fn mark_dirty<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.inner.write();
        for key in keys {
            if inner.unsaved.contains_key(key) {
                inner.dirty.insert(key.to_string());
            }
        }
    }

    /// Clear unsaved markers confirmed by the backend
    ///
    /// Only keys named in `acked` are touched, and only when the acknowledged
    /// revision is at least the latest unsaved one. Returns the keys cleared.
    pub fn acknowledge<'a>(&self, acked: impl IntoIterator<Item = (&'a str, u64)>) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut cleared = Vec::new();
        for (key, revision) in acked {
            let confirmed = inner.unsaved.get(key).is_some_and(|latest| *latest <= revision);
            if confirmed {
                inner.unsaved.remove(key);
                cleared.push(key.to_string());
            }
            let current = inner.revisions.get(key).copied();
            if current == Some(revision) {
                if let Some(setting) = inner.settings.get_mut(key) {
                    setting.authoritative = true;
                }
            }
        }
        cleared
    }

    /// Whether an unload should warn about unsaved edits
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        !self.inner.read().unsaved.is_empty()
    }

    /// Keys edited locally and not yet confirmed
    #[must_use]
    pub fn unsaved_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().unsaved.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Check whether `key` has an unconfirmed local edit
    #[must_use]
    pub fn is_unsaved(&self, key: &str) -> bool {
        self.inner.read().unsaved.contains_key(key)
    }

    /// Number of settings
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().settings.len()
    }

    /// Check if store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().settings.is_empty()
    }

    /// Register a change observer; called synchronously on every committed change
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove an observer
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Drop every observer (session teardown)
    pub fn clear_subscribers(&self) {
        self.subscribers.write().clear();
    }

    fn notify(&self, changes: &[StoreChange]) {
        if changes.is_empty() {
            return;
        }
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for change in changes {
            for subscriber in &subscribers {
                subscriber(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceTier;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn local_edit_marks_dirty_and_unsaved() {
        let store = SettingStore::new();
        store.set("width", json!(200), ChangeOrigin::Local);

        assert_eq!(store.get("width"), Some(json!(200)));
        assert_eq!(store.dirty_keys(), vec!["width"]);
        assert!(store.has_unsaved_changes());
        assert_eq!(store.setting("width").unwrap().source_tier, SourceTier::Memory);
    }

    #[test]
    fn authoritative_load_is_clean() {
        let store = SettingStore::new();
        store.set("width", json!(120), ChangeOrigin::RemoteAuthoritative);

        assert!(store.dirty_keys().is_empty());
        assert!(!store.has_unsaved_changes());
        assert!(store.setting("width").unwrap().authoritative);
    }

    #[test]
    fn broadcast_replaces_unsaved_local_edit() {
        let store = SettingStore::new();
        store.set("width", json!(100), ChangeOrigin::Local);
        store.set("width", json!(200), ChangeOrigin::Broadcast);

        assert_eq!(store.get("width"), Some(json!(200)));
        assert!(store.dirty_keys().is_empty());
        assert!(!store.is_unsaved("width"));
    }

    #[test]
    fn take_dirty_respects_hold_and_clears_dirty_only() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        store.set("b", json!(2), ChangeOrigin::Local);

        let taken = store.take_dirty(|k| k == "b");
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].key, "a");
        assert_eq!(store.dirty_keys(), vec!["b"]);
        assert!(store.is_unsaved("a"));
    }

    #[test]
    fn acknowledge_is_idempotent_and_scoped() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        store.set("b", json!(2), ChangeOrigin::Local);
        let taken = store.take_dirty(|k| k != "a");
        let acked: Vec<(&str, u64)> = taken.iter().map(|c| (c.key.as_str(), c.revision)).collect();

        assert_eq!(store.acknowledge(acked.clone()), vec!["a"]);
        assert!(store.acknowledge(acked).is_empty());
        assert_eq!(store.unsaved_keys(), vec!["b"]);
    }

    #[test]
    fn stale_ack_keeps_newer_edit_unsaved() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        let taken = store.take_dirty(|_| false);
        store.set("a", json!(2), ChangeOrigin::Local);

        assert!(store.acknowledge([("a", taken[0].revision)]).is_empty());
        assert!(store.is_unsaved("a"));
        assert!(!store.setting("a").unwrap().authoritative);
    }

    #[test]
    fn mark_dirty_only_for_unsaved_keys() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        store.set("b", json!(2), ChangeOrigin::RemoteAuthoritative);
        let _ = store.take_dirty(|_| false);

        store.mark_dirty(["a", "b"]);
        assert_eq!(store.dirty_keys(), vec!["a"]);
    }

    #[test]
    fn subscribers_see_every_change_until_unsubscribed() {
        let store = SettingStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = store.subscribe(move |change| sink.lock().push(change.key.clone()));

        store.set("a", json!(1), ChangeOrigin::Local);
        let mut values = SettingsMap::new();
        values.insert("b".into(), json!(2));
        values.insert("c".into(), json!(3));
        store.hydrate(&values, ChangeOrigin::Hydrate(SourceTier::Default));

        assert!(store.unsubscribe(id));
        store.set("d", json!(4), ChangeOrigin::Local);

        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn subscriber_may_read_store() {
        let store = Arc::new(SettingStore::new());
        let reader = Arc::clone(&store);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        store.subscribe(move |change| *sink.lock() = reader.get(&change.key));

        store.set("a", json!("x"), ChangeOrigin::Local);
        assert_eq!(*seen.lock(), Some(json!("x")));
    }

    #[test]
    fn resubmit_marks_current_value_unsaved() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        let sent = store.take_dirty(|_| false);
        store.set("a", json!(2), ChangeOrigin::Broadcast);
        assert!(!store.is_unsaved("a"));

        let again = store.resubmit("a").unwrap();
        assert_eq!(again.value, json!(2));
        assert_eq!(Some(again.revision), store.revision("a"));
        assert!(again.revision > sent[0].revision);
        assert!(store.is_unsaved("a"));
        assert!(store.dirty_keys().is_empty());
        assert!(store.resubmit("missing").is_none());
    }

    #[test]
    fn evict_clean_keeps_unsaved_edits() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Hydrate(SourceTier::Remote));
        store.set("b", json!(2), ChangeOrigin::Local);
        store.set("c", json!(3), ChangeOrigin::RemoteAuthoritative);

        assert_eq!(store.evict_clean(), vec!["a", "c"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("b"), Some(json!(2)));
        assert!(store.revision("a").is_none());
    }

    #[test]
    fn snapshot_copies_all_values() {
        let store = SettingStore::new();
        store.set("a", json!(1), ChangeOrigin::Local);
        store.set("b", json!(true), ChangeOrigin::Broadcast);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["b"], json!(true));
    }
}
