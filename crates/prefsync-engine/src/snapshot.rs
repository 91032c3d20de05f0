//! Local snapshot tiers
//!
//! A snapshot is one flat JSON document: setting keys at the top level plus
//! `_`-prefixed metadata keys (`_lastModified`, `_syncSource`). Snapshots are
//! rewritten after every committed batch and every authoritative load so the
//! next startup has a warm fallback.

use crate::gateway::DeliveryObserver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prefsync_core::{
    is_valid_key, PendingChange, SettingStore, SettingsMap, SourceTier, StorageError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persisted copy of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    /// When the snapshot was taken
    #[serde(rename = "_lastModified", default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
    /// Tier whose data the snapshot reflects
    #[serde(rename = "_syncSource", default = "default_source")]
    pub sync_source: SourceTier,
    /// Setting values
    #[serde(flatten)]
    pub settings: SettingsMap,
}

fn default_source() -> SourceTier {
    SourceTier::Memory
}

impl SnapshotDocument {
    /// Snapshot of `settings` stamped now; reserved keys are dropped
    #[must_use]
    pub fn new(settings: SettingsMap, sync_source: SourceTier) -> Self {
        Self {
            last_modified: Utc::now(),
            sync_source,
            settings: settings
                .into_iter()
                .filter(|(key, _)| is_valid_key(key))
                .collect(),
        }
    }

    /// Decode a stored document
    ///
    /// # Errors
    /// [`StorageError::Malformed`] if the bytes are not a snapshot object
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut document: Self =
            serde_json::from_slice(bytes).map_err(|e| StorageError::Malformed(e.to_string()))?;
        // Unknown metadata keys land in the flattened map
        document.settings.retain(|key, _| is_valid_key(key));
        Ok(document)
    }

    /// Encode for storage
    ///
    /// # Errors
    /// [`StorageError::Malformed`] if a value cannot be encoded
    pub fn to_vec(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| StorageError::Malformed(e.to_string()))
    }
}

/// A place a snapshot can be kept
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Read the stored snapshot, `None` if nothing was ever written
    ///
    /// # Errors
    /// Storage failure or undecodable document
    async fn read(&self) -> Result<Option<SnapshotDocument>, StorageError>;

    /// Replace the stored snapshot
    ///
    /// # Errors
    /// Storage failure, including quota exhaustion
    async fn write(&self, document: &SnapshotDocument) -> Result<(), StorageError>;
}

/// Snapshot kept in a JSON file
#[derive(Debug, Clone)]
pub struct FileSnapshotStorage {
    path: PathBuf,
}

impl FileSnapshotStorage {
    /// Store the snapshot at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn read(&self) -> Result<Option<SnapshotDocument>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => SnapshotDocument::from_slice(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, document: &SnapshotDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = document.to_vec()?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// Snapshot kept in memory, optionally bounded to a byte quota
#[derive(Debug, Default)]
pub struct MemorySnapshotStorage {
    document: Mutex<Option<SnapshotDocument>>,
    quota: Option<usize>,
}

impl MemorySnapshotStorage {
    /// Create empty storage
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse writes whose encoded size exceeds `bytes`
    #[must_use]
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Pre-populate with `settings`
    #[must_use]
    pub fn with_settings(self, settings: SettingsMap, source: SourceTier) -> Self {
        *self.document.lock() = Some(SnapshotDocument::new(settings, source));
        self
    }

    /// Stored document
    #[must_use]
    pub fn document(&self) -> Option<SnapshotDocument> {
        self.document.lock().clone()
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn read(&self) -> Result<Option<SnapshotDocument>, StorageError> {
        Ok(self.document.lock().clone())
    }

    async fn write(&self, document: &SnapshotDocument) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            if document.to_vec()?.len() > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        *self.document.lock() = Some(document.clone());
        Ok(())
    }
}

/// Rewrites the snapshot tiers from the store
pub struct SnapshotWriter {
    store: Arc<SettingStore>,
    targets: Vec<Arc<dyn SnapshotStorage>>,
}

impl std::fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotWriter")
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotWriter {
    /// Create writer for `targets`
    #[must_use]
    pub fn new(store: Arc<SettingStore>, targets: Vec<Arc<dyn SnapshotStorage>>) -> Self {
        Self { store, targets }
    }

    /// Write the confirmed contents of the store to every target
    ///
    /// Keys with unsaved local edits keep the value the target already holds,
    /// or are left out. Failures are logged and skipped; a full disk must not
    /// stop syncing. Returns the number of targets written.
    pub async fn write_all(&self, source: SourceTier) -> usize {
        let unsaved = self.store.unsaved_keys();
        let mut confirmed = self.store.snapshot();
        for key in &unsaved {
            confirmed.remove(key);
        }

        let mut written = 0;
        for target in &self.targets {
            let mut settings = confirmed.clone();
            if !unsaved.is_empty() {
                match target.read().await {
                    Ok(Some(previous)) => {
                        for key in &unsaved {
                            if let Some(value) = previous.settings.get(key) {
                                settings.insert(key.clone(), value.clone());
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(error) => tracing::debug!(%error, "previous snapshot unreadable"),
                }
            }
            let document = SnapshotDocument::new(settings, source);
            match target.write(&document).await {
                Ok(()) => written += 1,
                Err(error) => tracing::warn!(%error, "snapshot write failed"),
            }
        }
        written
    }
}

#[async_trait]
impl DeliveryObserver for SnapshotWriter {
    async fn on_committed(&self, _entries: &[PendingChange]) {
        self.write_all(SourceTier::Remote).await;
    }
}
