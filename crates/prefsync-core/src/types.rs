//! Core data model for settings synchronization
//!
//! Defines the fundamental types shared by every component:
//! - Settings and their provenance
//! - Pending changes and write batches
//! - Conflicts and resolution strategies
//! - Cross-context messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use ulid::Ulid;
use uuid::Uuid;

/// A setting value. Scalars are the normal case; objects take part in deep merges.
pub type SettingValue = serde_json::Value;

/// Ordered key → value map used for batches, snapshots and backend payloads
pub type SettingsMap = BTreeMap<String, SettingValue>;

/// Prefix reserved for snapshot metadata keys
pub const RESERVED_PREFIX: char = '_';

/// Check whether a key is usable as a setting name
#[inline]
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with(RESERVED_PREFIX)
}

/// Where a setting's current value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTier {
    /// Edited in this context, not yet confirmed
    Memory,
    /// Last-known local persistent snapshot
    LocalPersistent,
    /// Session-scoped snapshot
    Session,
    /// Backend store
    Remote,
    /// Built-in default
    Default,
}

impl SourceTier {
    /// Stable name used in logs and snapshot metadata
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::LocalPersistent => "local-persistent",
            Self::Session => "session",
            Self::Remote => "remote",
            Self::Default => "default",
        }
    }

    /// Parse a name written by [`SourceTier::as_str`]
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "memory" => Some(Self::Memory),
            "local-persistent" => Some(Self::LocalPersistent),
            "session" => Some(Self::Session),
            "remote" => Some(Self::Remote),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a value entered the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// User edit in this context
    Local,
    /// Value confirmed by the backend (initial load or background upgrade)
    RemoteAuthoritative,
    /// Value received from another context
    Broadcast,
    /// Startup hydration from a non-authoritative tier
    Hydrate(SourceTier),
    /// Overwritten with a known default
    Reset,
}

impl ChangeOrigin {
    /// Only edits made here need to be written back
    #[inline]
    #[must_use]
    pub fn marks_dirty(self) -> bool {
        matches!(self, Self::Local | Self::Reset)
    }

    /// Provenance recorded on the setting
    #[must_use]
    pub fn source_tier(self) -> SourceTier {
        match self {
            Self::Local | Self::Broadcast => SourceTier::Memory,
            Self::Reset => SourceTier::Default,
            Self::RemoteAuthoritative => SourceTier::Remote,
            Self::Hydrate(tier) => tier,
        }
    }
}

/// Current state of one setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// Unique id
    pub key: String,
    /// Current value
    pub value: SettingValue,
    /// Provenance of the value
    pub source_tier: SourceTier,
    /// Wall-clock time of the last mutation
    pub last_modified: DateTime<Utc>,
    /// Confirmed by the backend
    pub authoritative: bool,
}

impl Setting {
    /// Create a setting stamped with the current time
    #[must_use]
    pub fn new(key: impl Into<String>, value: SettingValue, source_tier: SourceTier) -> Self {
        Self {
            key: key.into(),
            value,
            source_tier,
            last_modified: Utc::now(),
            authoritative: source_tier == SourceTier::Remote,
        }
    }
}

/// One unacknowledged write
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Setting key
    pub key: String,
    /// Value to persist
    pub value: SettingValue,
    /// Store revision the value was read at
    pub revision: u64,
    /// When the change first entered a batch
    pub enqueued_at: Instant,
    /// Failed send attempts so far
    pub attempts: u32,
    /// Earliest time the next attempt may run
    pub next_retry_at: Instant,
}

impl PendingChange {
    /// Create a fresh change with no attempts
    #[must_use]
    pub fn new(key: impl Into<String>, value: SettingValue, revision: u64) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            revision,
            enqueued_at: now,
            attempts: 0,
            next_retry_at: now,
        }
    }
}

/// Unique batch identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Ulid);

impl BatchId {
    /// Generate new batch ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, deduplicated set of pending changes, one per key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Batch id, for logs
    pub id: BatchId,
    entries: Vec<PendingChange>,
}

impl Batch {
    /// Create empty batch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from changes; a later change for a key replaces the earlier one in place
    #[must_use]
    pub fn from_changes(changes: impl IntoIterator<Item = PendingChange>) -> Self {
        let mut batch = Self::new();
        for change in changes {
            batch.push(change);
        }
        batch
    }

    /// Add a change, replacing any entry for the same key
    pub fn push(&mut self, change: PendingChange) {
        match self.entries.iter_mut().find(|e| e.key == change.key) {
            Some(existing) => *existing = change,
            None => self.entries.push(change),
        }
    }

    /// Entries in insertion order
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[PendingChange] {
        &self.entries
    }

    /// Consume into entries
    #[inline]
    #[must_use]
    pub fn into_entries(self) -> Vec<PendingChange> {
        self.entries
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Key → value payload
    #[must_use]
    pub fn key_values(&self) -> SettingsMap {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if batch is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a divergent key is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Deep-merge structured values, otherwise the new value wins
    #[default]
    Merge,
    /// New value wins unconditionally
    Overwrite,
    /// Existing value is preserved
    Skip,
}

/// A key changed both here and elsewhere since the last read
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Setting key
    pub key: String,
    /// Value proposed by this context
    pub local_value: SettingValue,
    /// Value currently held by the backend
    pub remote_value: SettingValue,
    /// Strategy applied
    pub resolution_strategy: ResolutionStrategy,
}

/// Identity of one execution context, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    /// Generate new context ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a cross-context message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A committed change
    Broadcast,
    /// Receipt of a broadcast
    Ack,
}

/// Message exchanged between contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    /// Setting key
    pub key: String,
    /// Committed value
    pub value: SettingValue,
    /// Context that produced the message
    pub source_context_id: ContextId,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Broadcast or ack
    pub kind: MessageKind,
}

impl ContextMessage {
    /// Create a broadcast message stamped now
    #[must_use]
    pub fn broadcast(key: impl Into<String>, value: SettingValue, source: ContextId) -> Self {
        Self {
            key: key.into(),
            value,
            source_context_id: source,
            timestamp: Utc::now(),
            kind: MessageKind::Broadcast,
        }
    }

    /// Acknowledge this message on behalf of `receiver`
    #[must_use]
    pub fn ack(&self, receiver: ContextId) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            source_context_id: receiver,
            timestamp: Utc::now(),
            kind: MessageKind::Ack,
        }
    }

    /// Anti-echo check
    #[inline]
    #[must_use]
    pub fn is_from(&self, context: ContextId) -> bool {
        self.source_context_id == context
    }
}
