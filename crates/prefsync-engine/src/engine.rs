//! Session facade
//!
//! [`SyncEngine`] constructs and owns every service of one context (store,
//! scheduler, gateway, broadcaster, orchestrator) and tears them down
//! together. Consumers edit and read through it; nothing is looked up
//! ambiently.

use crate::backend::{BackendRequest, SettingsBackend};
use crate::broadcast::{Broadcaster, ChannelHub, Transport};
use crate::collaborators::{
    AcceptAll, NoopRestorer, Notice, Notifier, TracingNotifier, UiRestorer, Validator,
};
use crate::gateway::{DeliveryObserver, DeliveryReport, PersistenceGateway};
use crate::guard::isolated;
use crate::loader::{DefaultsTier, MultiTierLoader, RemoteTier, SnapshotTier};
use crate::orchestrator::{InitOrchestrator, InitReport, InitState};
use crate::resolver::{ConflictResolver, Resolution};
use crate::scheduler::{BatchScheduler, FlushOutcome};
use crate::snapshot::{SnapshotStorage, SnapshotWriter};
use crate::stats::{StatsRecorder, SyncStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use prefsync_core::{
    is_valid_key, ChangeOrigin, ConfigError, ContextId, PendingChange, ResolutionStrategy,
    Setting, SettingStore, SettingValue, SettingsMap, SourceTier, StoreChange, SubscriptionId,
    SyncConfig, SyncError, TaskScheduler, TokioScheduler,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Errors building a [`SyncEngine`]
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No backend was supplied
    #[error("a settings backend is required")]
    MissingBackend,

    /// Built outside a tokio runtime
    #[error("the engine must be built inside a tokio runtime")]
    NoRuntime,
}

/// Assembles a [`SyncEngine`]
pub struct SyncEngineBuilder {
    config: SyncConfig,
    backend: Option<Arc<dyn SettingsBackend>>,
    auth_token: String,
    transport: Option<Arc<dyn Transport>>,
    local_snapshot: Option<Arc<dyn SnapshotStorage>>,
    session_snapshot: Option<Arc<dyn SnapshotStorage>>,
    defaults: SettingsMap,
    validator: Arc<dyn Validator>,
    notifier: Arc<dyn Notifier>,
    restorer: Arc<dyn UiRestorer>,
    timer: Arc<dyn TaskScheduler>,
    context_id: Option<ContextId>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngineBuilder {
    /// Start with default config and headless collaborators
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            backend: None,
            auth_token: String::new(),
            transport: None,
            local_snapshot: None,
            session_snapshot: None,
            defaults: SettingsMap::new(),
            validator: Arc::new(AcceptAll),
            notifier: Arc::new(TracingNotifier),
            restorer: Arc::new(NoopRestorer),
            timer: Arc::new(TokioScheduler::new()),
            context_id: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set backend and the credential sent with every call
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn SettingsBackend>, auth_token: impl Into<String>) -> Self {
        self.backend = Some(backend);
        self.auth_token = auth_token.into();
        self
    }

    /// Set cross-context transport; a private channel is used otherwise
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set local persistent snapshot tier
    #[must_use]
    pub fn local_snapshot(mut self, storage: Arc<dyn SnapshotStorage>) -> Self {
        self.local_snapshot = Some(storage);
        self
    }

    /// Set session snapshot tier
    #[must_use]
    pub fn session_snapshot(mut self, storage: Arc<dyn SnapshotStorage>) -> Self {
        self.session_snapshot = Some(storage);
        self
    }

    /// Set built-in defaults
    #[must_use]
    pub fn defaults(mut self, defaults: SettingsMap) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set validator
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set notifier
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set UI restorer
    #[must_use]
    pub fn restorer(mut self, restorer: Arc<dyn UiRestorer>) -> Self {
        self.restorer = restorer;
        self
    }

    /// Set timer implementation
    #[must_use]
    pub fn timer(mut self, timer: Arc<dyn TaskScheduler>) -> Self {
        self.timer = timer;
        self
    }

    /// Use a fixed context id
    #[must_use]
    pub fn context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    /// Wire every service and start listening for sibling contexts
    ///
    /// # Errors
    /// - [`BuildError::Config`] for an invalid configuration
    /// - [`BuildError::MissingBackend`] without a backend
    /// - [`BuildError::NoRuntime`] outside a tokio runtime
    pub fn build(self) -> Result<Arc<SyncEngine>, BuildError> {
        self.config.validate()?;
        let backend = self.backend.ok_or(BuildError::MissingBackend)?;
        tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let config = self.config;
        let store = Arc::new(SettingStore::new());
        let stats = Arc::new(StatsRecorder::new());

        let snapshot_targets: Vec<Arc<dyn SnapshotStorage>> = [&self.local_snapshot, &self.session_snapshot]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        let snapshots = (!snapshot_targets.is_empty())
            .then(|| Arc::new(SnapshotWriter::new(Arc::clone(&store), snapshot_targets)));

        let mut loader = MultiTierLoader::new(config.tier_timeout())
            .with_tier(Arc::new(RemoteTier::new(Arc::clone(&backend), self.auth_token.clone())));
        if let Some(local) = &self.local_snapshot {
            loader = loader.with_tier(Arc::new(SnapshotTier::local(Arc::clone(local))));
        }
        if let Some(session) = &self.session_snapshot {
            loader = loader.with_tier(Arc::new(SnapshotTier::session(Arc::clone(session))));
        }
        if !self.defaults.is_empty() {
            loader = loader.with_tier(Arc::new(DefaultsTier::new(self.defaults.clone())));
        }
        let loader = Arc::new(loader);

        let gateway = Arc::new(PersistenceGateway::new(
            backend,
            Arc::clone(&store),
            Arc::clone(&self.timer),
            config.clone(),
            self.auth_token,
            Arc::clone(&stats),
        ));
        // A value from a sibling or the backend replaces any queued write of that key
        let superseding = Arc::downgrade(&gateway);
        store.subscribe(move |change| {
            if change.origin.marks_dirty() {
                return;
            }
            if let Some(gateway) = superseding.upgrade() {
                gateway.supersede(&change.key);
            }
        });
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&self.timer),
            config.clone(),
        ));

        let transport = self
            .transport
            .unwrap_or_else(|| -> Arc<dyn Transport> { Arc::new(ChannelHub::new().transport()) });
        let mut broadcaster = Broadcaster::new(Arc::clone(&store), transport, Arc::clone(&stats))
            .with_acks(config.acknowledge_broadcasts);
        if let Some(context_id) = self.context_id {
            broadcaster = broadcaster.with_context_id(context_id);
        }
        let broadcaster = Arc::new(broadcaster);

        let mut orchestrator = InitOrchestrator::new(
            Arc::clone(&store),
            loader,
            Arc::clone(&self.timer),
            config.clone(),
            Arc::clone(&stats),
        )
        .with_restorer(self.restorer)
        .with_validator(Arc::clone(&self.validator))
        .with_notifier(Arc::clone(&self.notifier))
        .with_defaults(self.defaults.clone());
        if let Some(writer) = &snapshots {
            orchestrator = orchestrator.with_snapshot_writer(Arc::clone(writer));
        }

        let last_read = Arc::new(Mutex::new(SettingsMap::new()));
        gateway.add_observer(Arc::new(LastReadTracker {
            last_read: Arc::clone(&last_read),
        }));
        if let Some(writer) = &snapshots {
            gateway.add_observer(Arc::clone(writer) as Arc<dyn DeliveryObserver>);
        }
        gateway.add_observer(Arc::clone(&broadcaster) as Arc<dyn DeliveryObserver>);
        gateway.add_observer(Arc::new(FailureNotices {
            notifier: Arc::clone(&self.notifier),
        }));

        broadcaster.start();
        tracing::info!(
            context_id = %broadcaster.context_id(),
            transport = broadcaster.transport_name(),
            "sync engine built"
        );

        Ok(Arc::new(SyncEngine {
            resolver: ConflictResolver::new(config.merge_depth_limit),
            config,
            store,
            stats,
            gateway,
            scheduler,
            broadcaster,
            orchestrator: Arc::new(orchestrator),
            snapshots,
            validator: self.validator,
            notifier: self.notifier,
            defaults: self.defaults,
            last_read,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Records committed values as the last state read from the backend
struct LastReadTracker {
    last_read: Arc<Mutex<SettingsMap>>,
}

#[async_trait]
impl DeliveryObserver for LastReadTracker {
    async fn on_committed(&self, entries: &[PendingChange]) {
        let mut last_read = self.last_read.lock();
        for entry in entries {
            last_read.insert(entry.key.clone(), entry.value.clone());
        }
    }
}

/// Surfaces refused and abandoned writes to the user
struct FailureNotices {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl DeliveryObserver for FailureNotices {
    async fn on_rejected(&self, entries: &[PendingChange], error: &SyncError) {
        let keys = entries.iter().map(|e| e.key.clone()).collect();
        self.notifier
            .show_error(Notice::new(format!("Settings were rejected: {error}")).with_keys(keys));
    }

    async fn on_exhausted(&self, entries: &[PendingChange], error: &SyncError) {
        let keys = entries.iter().map(|e| e.key.clone()).collect();
        self.notifier.show_error(
            Notice::new(format!("Settings could not be saved: {error}")).with_keys(keys),
        );
    }
}

/// One context's settings synchronization session
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<SettingStore>,
    stats: Arc<StatsRecorder>,
    gateway: Arc<PersistenceGateway>,
    scheduler: Arc<BatchScheduler>,
    broadcaster: Arc<Broadcaster>,
    orchestrator: Arc<InitOrchestrator>,
    resolver: ConflictResolver,
    snapshots: Option<Arc<SnapshotWriter>>,
    validator: Arc<dyn Validator>,
    notifier: Arc<dyn Notifier>,
    defaults: SettingsMap,
    last_read: Arc<Mutex<SettingsMap>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("context_id", &self.context_id())
            .field("state", &self.state())
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Start building an engine
    #[inline]
    #[must_use]
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Hydrate the store; idempotent, concurrent calls share one run
    pub async fn initialize(&self) -> InitReport {
        let report = self.orchestrator.initialize().await;
        if report.authoritative {
            *self.last_read.lock() = self.store.snapshot();
        }
        report
    }

    /// Apply a local edit and schedule it for saving
    ///
    /// # Errors
    /// - [`SyncError::Closed`] after shutdown
    /// - [`SyncError::ReadOnly`] while degraded to read-only
    /// - [`SyncError::Validation`] for a reserved key or a value the validator refuses
    pub fn edit(&self, key: &str, value: SettingValue) -> Result<StoreChange, SyncError> {
        self.ensure_writable()?;
        let value = self.validate(key, &value)?;
        let change = self.store.set(key, value, ChangeOrigin::Local);
        self.scheduler.enqueue(key);
        Ok(change)
    }

    /// Apply several edits after reconciling them with the latest remote state
    ///
    /// Nothing is applied unless every value validates. When the remote state
    /// cannot be fetched, the update is applied as if nothing diverged.
    ///
    /// # Errors
    /// - [`SyncError::Closed`], [`SyncError::ReadOnly`], [`SyncError::Validation`] as for [`SyncEngine::edit`]
    /// - [`SyncError::Conflict`] when resolution fails
    pub async fn batch_update(
        &self,
        values: SettingsMap,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, SyncError> {
        self.ensure_writable()?;
        let mut update = SettingsMap::new();
        for (key, value) in &values {
            update.insert(key.clone(), self.validate(key, value)?);
        }

        let last_read = self.last_read.lock().clone();
        let remote = match self.fetch_remote().await {
            Ok(remote) => remote,
            Err(error) => {
                tracing::warn!(%error, "remote state unavailable, skipping conflict detection");
                last_read.clone()
            }
        };

        let resolution = self
            .resolver
            .resolve(&update, &remote, &last_read, strategy)
            .map_err(|error| {
                let keys = update.keys().cloned().collect();
                self.notifier
                    .show_error(Notice::new(format!("Conflicting changes: {error}")).with_keys(keys));
                error
            })?;

        for (key, value) in &resolution.kept_remote {
            self.store.set(key, value.clone(), ChangeOrigin::RemoteAuthoritative);
        }
        for (key, value) in &resolution.values {
            self.store.set(key, value.clone(), ChangeOrigin::Local);
            self.scheduler.enqueue(key);
        }
        self.last_read.lock().extend(remote);
        if !resolution.conflicts.is_empty() {
            tracing::info!(
                conflicts = resolution.conflicts.len(),
                ?strategy,
                "batch update reconciled"
            );
        }
        Ok(resolution)
    }

    /// Overwrite `key` with its built-in default and save it
    ///
    /// # Errors
    /// [`SyncError::Validation`] when `key` has no default, or as for [`SyncEngine::edit`]
    pub fn reset(&self, key: &str) -> Result<StoreChange, SyncError> {
        self.ensure_writable()?;
        let default = self
            .defaults
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::validation(key, "no default value"))?;
        let change = self.store.set(key, default, ChangeOrigin::Reset);
        self.scheduler.enqueue(key);
        Ok(change)
    }

    /// Reset every setting on the backend and re-hydrate the store
    ///
    /// Pending local edits and queued retries are discarded.
    ///
    /// # Errors
    /// Classified failure of the backend call
    pub async fn reset_all(&self) -> Result<SettingsMap, SyncError> {
        self.ensure_writable()?;
        let request = BackendRequest::reset(SettingsMap::new(), self.gateway.auth_token());
        let response = isolated(self.config.request_timeout(), self.gateway.backend().call(request)).await?;
        let restored = response.into_result()?;

        let dropped = self.gateway.discard_queued();
        let values = restored.unwrap_or_else(|| self.defaults.clone());
        self.store.hydrate(&values, ChangeOrigin::RemoteAuthoritative);
        *self.last_read.lock() = values.clone();
        if let Some(writer) = &self.snapshots {
            writer.write_all(SourceTier::Remote).await;
        }
        tracing::info!(keys = values.len(), dropped, "all settings reset");
        self.notifier.show_info(Notice::new("Settings reset to defaults"));
        Ok(values)
    }

    async fn fetch_remote(&self) -> Result<SettingsMap, SyncError> {
        let request = BackendRequest::load(self.gateway.auth_token(), true);
        let response = isolated(self.config.request_timeout(), self.gateway.backend().call(request)).await?;
        Ok(response.into_result()?.unwrap_or_default())
    }

    fn ensure_writable(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        if self.orchestrator.is_read_only() {
            return Err(SyncError::ReadOnly);
        }
        Ok(())
    }

    fn validate(&self, key: &str, value: &SettingValue) -> Result<SettingValue, SyncError> {
        if !is_valid_key(key) {
            self.stats.validation_rejected();
            return Err(SyncError::validation(key, "reserved or empty key"));
        }
        let outcome = self.validator.validate(key, value);
        if !outcome.valid {
            self.stats.validation_rejected();
            let reason = outcome.error.unwrap_or_else(|| "invalid value".to_string());
            tracing::debug!(key, %reason, "edit rejected by validator");
            return Err(SyncError::validation(key, reason));
        }
        Ok(outcome.sanitized_value)
    }

    /// Current value of `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.store.get(key)
    }

    /// Full record of `key`
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<Setting> {
        self.store.setting(key)
    }

    /// Copy of every current value
    #[must_use]
    pub fn snapshot(&self) -> SettingsMap {
        self.store.snapshot()
    }

    /// Observe committed store changes
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }

    /// Stop observing
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Mark the backend reachable or not; reconnecting sweeps the retry queue
    pub async fn set_online(&self, online: bool) -> DeliveryReport {
        self.gateway.set_online(online).await
    }

    /// Flush every pending edit now, ignoring debounce windows
    pub async fn flush_now(&self) -> Vec<FlushOutcome> {
        self.scheduler.flush_all().await
    }

    /// Whether an unload should warn
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.store.has_unsaved_changes()
    }

    /// Keys with unconfirmed local edits
    #[must_use]
    pub fn unsaved_keys(&self) -> Vec<String> {
        self.store.unsaved_keys()
    }

    /// Entries waiting for a retry
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.gateway.queue_len()
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    /// Identity of this context
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.broadcaster.context_id()
    }

    /// Initialization state
    #[must_use]
    pub fn state(&self) -> InitState {
        self.orchestrator.state()
    }

    /// Latest initialization report
    #[must_use]
    pub fn init_report(&self) -> InitReport {
        self.orchestrator.report()
    }

    /// Whether edits are refused
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.orchestrator.is_read_only()
    }

    /// Effective configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<SettingStore> {
        &self.store
    }

    /// Underlying gateway
    #[inline]
    #[must_use]
    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    /// Underlying scheduler
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    /// Underlying orchestrator
    #[inline]
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<InitOrchestrator> {
        &self.orchestrator
    }

    /// Tear the session down: final best-effort flush, then stop every timer and listener
    ///
    /// Returns the keys still unsaved afterwards. Later calls do nothing.
    pub async fn shutdown(&self) -> Vec<String> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.store.unsaved_keys();
        }
        let deadline = self.config.request_timeout();
        if tokio::time::timeout(deadline, self.scheduler.flush_all()).await.is_err() {
            tracing::warn!("final flush timed out");
        }
        self.scheduler.shutdown();
        self.gateway.shutdown();
        self.orchestrator.shutdown();
        self.broadcaster.close();
        self.store.clear_subscribers();

        let unsaved = self.store.unsaved_keys();
        tracing::info!(unsaved = unsaved.len(), "sync engine shut down");
        unsaved
    }
}
