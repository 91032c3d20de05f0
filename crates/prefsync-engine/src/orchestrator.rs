//! Initialization orchestrator
//!
//! Runs `Loading → Applying → RestoringUi → Validating → Complete` exactly
//! once per session. Any unrecoverable error moves to `FallbackMode`, where a
//! background loop periodically re-runs the sequence through `Recovering`
//! until it succeeds or the recovery budget runs out.
//!
//! When a non-authoritative tier wins, a background upgrade keeps re-fetching
//! the remote tier and applies it to every key without an unsaved local edit.

use crate::collaborators::{AcceptAll, NoopRestorer, Notice, Notifier, TracingNotifier, UiRestorer, Validator};
use crate::loader::{LoadOutcome, MultiTierLoader};
use crate::snapshot::SnapshotWriter;
use crate::stats::StatsRecorder;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use prefsync_core::{
    ChangeOrigin, ScheduledTask, SettingStore, SettingsMap, SourceTier, StorageError,
    SyncConfig, SyncError, TaskScheduler,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Startup state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    /// `initialize` not called yet
    NotStarted,
    /// Walking the tier chain
    Loading,
    /// Hydrating the store
    Applying,
    /// Re-applying settings to the UI
    RestoringUi,
    /// Checking hydrated values
    Validating,
    /// Ready
    Complete,
    /// Degraded after an unrecoverable error
    FallbackMode,
    /// Re-attempting initialization from fallback mode
    Recovering,
}

/// Error for an illegal state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal init transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// Current state
    pub from: InitState,
    /// Requested state
    pub to: InitState,
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: InitState) -> Vec<InitState> {
    use InitState::*;
    match from {
        NotStarted => vec![Loading, FallbackMode],
        Loading => vec![Applying, FallbackMode],
        Applying => vec![RestoringUi, FallbackMode],
        RestoringUi => vec![Validating, FallbackMode],
        Validating => vec![Complete, FallbackMode],
        Complete => vec![],
        FallbackMode => vec![Recovering],
        Recovering => vec![Loading, FallbackMode],
    }
}

/// Check a state change against [`allowed_transitions`]
///
/// # Errors
/// [`IllegalTransition`] when `to` is not reachable from `from`
pub fn validate_transition(from: InitState, to: InitState) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Classification of a startup failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitFailureKind {
    /// Backend unreachable
    Network,
    /// A source did not answer in time
    Timeout,
    /// Stored or returned data could not be decoded
    DataCorruption,
    /// Access denied
    Permission,
    /// A storage tier unavailable or full
    Storage,
    /// Anything else
    Other,
}

impl InitFailureKind {
    /// Classify an error
    #[must_use]
    pub fn classify(error: &SyncError) -> Self {
        match error {
            SyncError::Network(_) | SyncError::Server { .. } => Self::Network,
            SyncError::Timeout(_) => Self::Timeout,
            SyncError::Protocol(_)
            | SyncError::Validation { .. }
            | SyncError::Storage(StorageError::Malformed(_)) => Self::DataCorruption,
            SyncError::Storage(StorageError::PermissionDenied(_)) => Self::Permission,
            SyncError::Storage(_) => Self::Storage,
            SyncError::Conflict { .. } | SyncError::ReadOnly | SyncError::Closed => Self::Other,
        }
    }

    /// Recovery actions for this kind of failure
    #[must_use]
    pub fn plan(self) -> RecoveryPlan {
        let (retry, use_cached_tier, use_defaults, notify_user, read_only) = match self {
            Self::Network => (true, true, false, false, false),
            Self::Timeout => (true, true, true, false, false),
            Self::DataCorruption => (false, false, true, true, false),
            Self::Permission => (false, true, false, true, true),
            Self::Storage => (true, false, true, true, false),
            Self::Other => (true, true, true, true, false),
        };
        RecoveryPlan {
            retry,
            use_cached_tier,
            use_defaults,
            notify_user,
            read_only,
        }
    }
}

impl std::fmt::Display for InitFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::DataCorruption => "data-corruption",
            Self::Permission => "permission",
            Self::Storage => "storage",
            Self::Other => "other",
        })
    }
}

/// What to do after a startup failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoveryPlan {
    /// Run the background recovery loop
    pub retry: bool,
    /// Keep values already loaded from a tier; otherwise they are evicted
    pub use_cached_tier: bool,
    /// Hydrate built-in defaults, only into missing keys when cached values are kept
    pub use_defaults: bool,
    /// Tell the user
    pub notify_user: bool,
    /// Refuse local edits until recovered
    pub read_only: bool,
}

/// A classified startup failure
#[derive(Debug, Clone, PartialEq)]
pub struct InitFailure {
    /// Classification
    pub kind: InitFailureKind,
    /// Description
    pub message: String,
    /// Whether every tier failed
    pub all_tiers_failed: bool,
}

/// Result of initialization
#[derive(Debug, Clone, PartialEq)]
pub struct InitReport {
    /// State reached
    pub state: InitState,
    /// Tier that hydrated the store
    pub tier: Option<SourceTier>,
    /// Whether the hydrated values are backend-confirmed
    pub authoritative: bool,
    /// Keys hydrated; in fallback mode, kept cached values plus defaults applied
    pub loaded_keys: usize,
    /// Loaded values replaced during validation
    pub invalid_keys: Vec<String>,
    /// Failure that forced fallback mode
    pub failure: Option<InitFailure>,
    /// Actions taken for that failure
    pub plan: Option<RecoveryPlan>,
    /// Whether edits are refused
    pub read_only: bool,
}

impl InitReport {
    fn new(state: InitState) -> Self {
        Self {
            state,
            tier: None,
            authoritative: false,
            loaded_keys: 0,
            invalid_keys: Vec::new(),
            failure: None,
            plan: None,
            read_only: false,
        }
    }

    /// Whether the engine is fully initialized
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == InitState::Complete
    }
}

type InFlight = Shared<BoxFuture<'static, InitReport>>;

/// Sequences startup and recovers from degraded mode
pub struct InitOrchestrator {
    store: Arc<SettingStore>,
    loader: Arc<MultiTierLoader>,
    timer: Arc<dyn TaskScheduler>,
    config: SyncConfig,
    stats: Arc<StatsRecorder>,
    restorer: Arc<dyn UiRestorer>,
    validator: Arc<dyn Validator>,
    notifier: Arc<dyn Notifier>,
    snapshots: Option<Arc<SnapshotWriter>>,
    defaults: SettingsMap,
    state: watch::Sender<InitState>,
    report: Mutex<InitReport>,
    in_flight: Mutex<Option<InFlight>>,
    read_only: AtomicBool,
    closed: AtomicBool,
    recovery_task: Mutex<Option<ScheduledTask>>,
    upgrade_task: Mutex<Option<ScheduledTask>>,
}

impl std::fmt::Debug for InitOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOrchestrator")
            .field("state", &self.state())
            .field("read_only", &self.is_read_only())
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

impl InitOrchestrator {
    /// Create orchestrator with headless collaborators
    #[must_use]
    pub fn new(
        store: Arc<SettingStore>,
        loader: Arc<MultiTierLoader>,
        timer: Arc<dyn TaskScheduler>,
        config: SyncConfig,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        let (state, _) = watch::channel(InitState::NotStarted);
        Self {
            store,
            loader,
            timer,
            config,
            stats,
            restorer: Arc::new(NoopRestorer),
            validator: Arc::new(AcceptAll),
            notifier: Arc::new(TracingNotifier),
            snapshots: None,
            defaults: SettingsMap::new(),
            state,
            report: Mutex::new(InitReport::new(InitState::NotStarted)),
            in_flight: Mutex::new(None),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recovery_task: Mutex::new(None),
            upgrade_task: Mutex::new(None),
        }
    }

    /// Set UI restorer
    #[must_use]
    pub fn with_restorer(mut self, restorer: Arc<dyn UiRestorer>) -> Self {
        self.restorer = restorer;
        self
    }

    /// Set validator for loaded values
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Rewrite snapshots after authoritative loads
    #[must_use]
    pub fn with_snapshot_writer(mut self, writer: Arc<SnapshotWriter>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Emergency values for fallback mode and invalid loaded values
    #[must_use]
    pub fn with_defaults(mut self, defaults: SettingsMap) -> Self {
        self.defaults = defaults;
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> InitState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<InitState> {
        self.state.subscribe()
    }

    /// Latest report, updated by recovery and upgrades
    #[must_use]
    pub fn report(&self) -> InitReport {
        self.report.lock().clone()
    }

    /// Whether local edits are refused
    #[inline]
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Run startup once; concurrent and later calls share the first result
    pub async fn initialize(self: &Arc<Self>) -> InitReport {
        let shared = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let this = Arc::clone(self);
                    let future = async move { this.startup().await }.boxed().shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        shared.await
    }

    async fn startup(self: &Arc<Self>) -> InitReport {
        tracing::info!(tiers = ?self.loader.tier_names(), "initializing settings");
        match self.run_sequence().await {
            Ok(report) => report,
            Err(failure) => self.enter_fallback(failure),
        }
    }

    fn transition(&self, to: InitState) -> Result<(), InitFailure> {
        let from = self.state();
        validate_transition(from, to).map_err(|e| InitFailure {
            kind: InitFailureKind::Other,
            message: e.to_string(),
            all_tiers_failed: false,
        })?;
        self.state.send_replace(to);
        tracing::debug!(?from, ?to, "init state changed");
        Ok(())
    }

    async fn run_sequence(self: &Arc<Self>) -> Result<InitReport, InitFailure> {
        self.transition(InitState::Loading)?;
        let outcome = self.loader.load().await;
        if outcome.all_failed() {
            return Err(Self::load_failure(&outcome));
        }

        self.transition(InitState::Applying)?;
        let origin = match outcome.tier {
            Some(_) if outcome.authoritative => ChangeOrigin::RemoteAuthoritative,
            Some(tier) => ChangeOrigin::Hydrate(tier),
            None => ChangeOrigin::Hydrate(SourceTier::Default),
        };
        let applied = self.apply_clean(&outcome.settings, origin);
        self.stats.set_startup_tier(outcome.tier);

        self.transition(InitState::RestoringUi)?;
        self.restorer
            .restore(&self.store.snapshot())
            .map_err(|message| InitFailure {
                kind: InitFailureKind::DataCorruption,
                message: format!("ui restore failed: {message}"),
                all_tiers_failed: false,
            })?;

        self.transition(InitState::Validating)?;
        let invalid_keys = self.validate_loaded(origin);

        self.transition(InitState::Complete)?;
        self.read_only.store(false, Ordering::Release);

        let mut report = InitReport::new(InitState::Complete);
        report.tier = outcome.tier;
        report.authoritative = outcome.authoritative;
        report.loaded_keys = applied;
        report.invalid_keys = invalid_keys;
        *self.report.lock() = report.clone();

        tracing::info!(
            tier = ?outcome.tier,
            authoritative = outcome.authoritative,
            keys = applied,
            "settings initialized"
        );
        if outcome.authoritative {
            self.write_snapshots().await;
        } else if !self.closed.load(Ordering::Acquire) {
            self.schedule_upgrade();
        }
        Ok(report)
    }

    fn load_failure(outcome: &LoadOutcome) -> InitFailure {
        let primary = outcome.failures.first();
        InitFailure {
            kind: primary.map_or(InitFailureKind::Other, |f| InitFailureKind::classify(&f.error)),
            message: outcome
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.name, f.error))
                .collect::<Vec<_>>()
                .join("; "),
            all_tiers_failed: true,
        }
    }

    /// Hydrate without touching keys that hold unsaved local edits
    fn apply_clean(&self, values: &SettingsMap, origin: ChangeOrigin) -> usize {
        let clean: SettingsMap = values
            .iter()
            .filter(|(key, _)| !self.store.is_unsaved(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.store.hydrate(&clean, origin);
        clean.len()
    }

    fn validate_loaded(&self, origin: ChangeOrigin) -> Vec<String> {
        let mut invalid = Vec::new();
        for (key, value) in self.store.snapshot() {
            let outcome = self.validator.validate(&key, &value);
            if outcome.valid {
                if outcome.sanitized_value != value {
                    self.store.set(&key, outcome.sanitized_value, origin);
                }
                continue;
            }
            tracing::warn!(key = %key, error = ?outcome.error, "loaded value failed validation");
            if let Some(default) = self.defaults.get(&key) {
                self.store
                    .set(&key, default.clone(), ChangeOrigin::Hydrate(SourceTier::Default));
            }
            invalid.push(key);
        }
        invalid
    }

    fn enter_fallback(self: &Arc<Self>, failure: InitFailure) -> InitReport {
        if let Err(error) = self.transition(InitState::FallbackMode) {
            tracing::error!(message = %error.message, "cannot enter fallback mode");
        }
        let plan = failure.kind.plan();
        tracing::error!(
            kind = %failure.kind,
            message = %failure.message,
            ?plan,
            "initialization failed, entering fallback mode"
        );

        let kept = if plan.use_cached_tier {
            self.store.len()
        } else {
            let evicted = self.store.evict_clean();
            if !evicted.is_empty() {
                tracing::warn!(keys = ?evicted, "discarded untrusted loaded values");
            }
            0
        };
        let applied = if plan.use_defaults {
            let missing: SettingsMap = self
                .defaults
                .iter()
                .filter(|(key, _)| !plan.use_cached_tier || self.store.get(key).is_none())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.apply_clean(&missing, ChangeOrigin::Hydrate(SourceTier::Default))
        } else {
            0
        };
        self.read_only.store(plan.read_only, Ordering::Release);
        if plan.notify_user || failure.all_tiers_failed {
            let notice = Notice::new(format!("Settings could not be loaded ({})", failure.kind));
            let notice = if failure.all_tiers_failed {
                notice.persistent()
            } else {
                notice
            };
            self.notifier.show_error(notice);
        }

        let mut report = InitReport::new(InitState::FallbackMode);
        report.failure = Some(failure);
        report.plan = Some(plan);
        report.read_only = plan.read_only;
        report.loaded_keys = kept + applied;
        *self.report.lock() = report.clone();

        if plan.retry {
            self.schedule_recovery(1);
        }
        report
    }

    fn schedule_recovery(self: &Arc<Self>, attempt: u32) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if attempt > self.config.recovery_budget {
            tracing::error!(budget = self.config.recovery_budget, "recovery budget exhausted");
            return;
        }
        let delay = self.config.recovery_delay(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "recovery scheduled");
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = self.timer.schedule(
            delay,
            async move {
                if let Some(orchestrator) = weak.upgrade() {
                    drop(orchestrator.recovery_task.lock().take());
                    orchestrator.recover(attempt).await;
                }
            }
            .boxed(),
        );
        if let Some(previous) = self.recovery_task.lock().replace(task) {
            previous.cancel();
        }
    }

    async fn recover(self: &Arc<Self>, attempt: u32) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.transition(InitState::Recovering) {
            tracing::error!(message = %error.message, "recovery not possible");
            return;
        }
        match self.run_sequence().await {
            Ok(_) => {
                tracing::info!(attempt, "recovered from fallback mode");
                self.notifier.show_info(Notice::new("Settings restored"));
            }
            Err(failure) => {
                tracing::warn!(attempt, kind = %failure.kind, message = %failure.message, "recovery attempt failed");
                if let Err(error) = self.transition(InitState::FallbackMode) {
                    tracing::error!(message = %error.message, "cannot return to fallback mode");
                }
                self.report.lock().failure = Some(failure);
                self.schedule_recovery(attempt + 1);
            }
        }
    }

    fn schedule_upgrade(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = self.timer.schedule(
            self.config.upgrade_interval(),
            async move {
                if let Some(orchestrator) = weak.upgrade() {
                    drop(orchestrator.upgrade_task.lock().take());
                    orchestrator.try_upgrade().await;
                }
            }
            .boxed(),
        );
        if let Some(previous) = self.upgrade_task.lock().replace(task) {
            previous.cancel();
        }
    }

    /// One background attempt to replace cached values with authoritative ones
    ///
    /// Returns whether the upgrade happened; reschedules itself otherwise.
    pub async fn try_upgrade(self: &Arc<Self>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.loader.fetch_authoritative().await {
            Ok(remote) => {
                let applied = self.apply_clean(&remote, ChangeOrigin::RemoteAuthoritative);
                {
                    let mut report = self.report.lock();
                    report.authoritative = true;
                    report.tier = Some(SourceTier::Remote);
                }
                tracing::info!(keys = applied, "upgraded store to authoritative values");
                self.write_snapshots().await;
                true
            }
            Err(error) => {
                tracing::debug!(%error, "authoritative fetch still failing");
                if !self.closed.load(Ordering::Acquire) {
                    self.schedule_upgrade();
                }
                false
            }
        }
    }

    async fn write_snapshots(&self) {
        if let Some(writer) = &self.snapshots {
            writer.write_all(SourceTier::Remote).await;
        }
    }

    /// Whether a background upgrade is pending
    #[must_use]
    pub fn upgrade_pending(&self) -> bool {
        self.upgrade_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Whether a recovery attempt is pending
    #[must_use]
    pub fn recovery_pending(&self) -> bool {
        self.recovery_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel background work
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in [&self.recovery_task, &self.upgrade_task] {
            if let Some(task) = slot.lock().take() {
                task.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{DefaultsTier, LoadTier};
    use async_trait::async_trait;
    use prefsync_core::TokioScheduler;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Tier failing a fixed number of times, then serving `values`
    struct Scripted {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        error: SyncError,
        values: SettingsMap,
    }

    impl Scripted {
        fn new(failures: usize, error: SyncError, values: SettingsMap) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                error,
                values,
            }
        }
    }

    #[async_trait]
    impl LoadTier for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn tier(&self) -> SourceTier {
            SourceTier::Remote
        }

        fn authoritative(&self) -> bool {
            true
        }

        async fn attempt(&self) -> Result<SettingsMap, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(self.values.clone())
        }
    }

    #[derive(Default)]
    struct Notices(Mutex<Vec<Notice>>);

    impl Notifier for Notices {
        fn show_error(&self, notice: Notice) {
            self.0.lock().push(notice);
        }

        fn show_info(&self, _notice: Notice) {}
    }

    fn values(pairs: &[(&str, serde_json::Value)]) -> SettingsMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn orchestrator(loader: MultiTierLoader) -> (Arc<SettingStore>, InitOrchestrator) {
        let store = Arc::new(SettingStore::new());
        let orchestrator = InitOrchestrator::new(
            Arc::clone(&store),
            Arc::new(loader),
            Arc::new(TokioScheduler::new()),
            SyncConfig::new(),
            Arc::new(StatsRecorder::new()),
        );
        (store, orchestrator)
    }

    #[test]
    fn transition_table() {
        assert!(validate_transition(InitState::NotStarted, InitState::Loading).is_ok());
        assert!(validate_transition(InitState::Validating, InitState::FallbackMode).is_ok());
        assert!(validate_transition(InitState::FallbackMode, InitState::Recovering).is_ok());
        assert!(validate_transition(InitState::Recovering, InitState::Loading).is_ok());
        assert!(validate_transition(InitState::Loading, InitState::Complete).is_err());
        assert!(allowed_transitions(InitState::Complete).is_empty());
    }

    #[test]
    fn every_failure_kind_has_a_distinct_plan() {
        let kinds = [
            InitFailureKind::Network,
            InitFailureKind::Timeout,
            InitFailureKind::DataCorruption,
            InitFailureKind::Permission,
            InitFailureKind::Storage,
            InitFailureKind::Other,
        ];
        let plans: HashSet<RecoveryPlan> = kinds.iter().map(|k| k.plan()).collect();
        assert_eq!(plans.len(), kinds.len());
        assert!(InitFailureKind::Permission.plan().read_only);
        assert!(!InitFailureKind::DataCorruption.plan().retry);
    }

    #[test]
    fn classification() {
        use InitFailureKind as K;
        assert_eq!(K::classify(&SyncError::Network("x".into())), K::Network);
        assert_eq!(K::classify(&SyncError::Timeout(Duration::ZERO)), K::Timeout);
        assert_eq!(
            K::classify(&SyncError::Storage(StorageError::Malformed("x".into()))),
            K::DataCorruption
        );
        assert_eq!(
            K::classify(&SyncError::Storage(StorageError::PermissionDenied("x".into()))),
            K::Permission
        );
        assert_eq!(K::classify(&SyncError::Storage(StorageError::QuotaExceeded)), K::Storage);
        assert_eq!(K::classify(&SyncError::Closed), K::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_initialize_runs_once() {
        let tier = Arc::new(Scripted::new(0, SyncError::Closed, values(&[("a", json!(1))])));
        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(tier.clone());
        let (store, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(orchestrator);

        let (first, second) = tokio::join!(orchestrator.initialize(), orchestrator.initialize());
        assert_eq!(first, second);
        assert!(first.is_complete());
        assert!(first.authoritative);
        assert_eq!(tier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("a"), Some(json!(1)));

        let again = orchestrator.initialize().await;
        assert_eq!(again, first);
        assert_eq!(tier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_falls_back_and_recovers() {
        let tier = Arc::new(Scripted::new(
            2,
            SyncError::Network("down".into()),
            values(&[("width", json!(200))]),
        ));
        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(tier.clone());
        let notices = Arc::new(Notices::default());
        let (store, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(
            orchestrator
                .with_notifier(notices.clone())
                .with_defaults(values(&[("width", json!(100))])),
        );

        let report = orchestrator.initialize().await;
        assert_eq!(report.state, InitState::FallbackMode);
        assert_eq!(report.failure.as_ref().unwrap().kind, InitFailureKind::Network);
        assert!(!report.read_only);
        assert!(orchestrator.recovery_pending());
        // Network plan keeps cached data, defaults are not hydrated
        assert_eq!(store.get("width"), None);
        let shown = notices.0.lock().clone();
        assert_eq!(shown.len(), 1);
        assert!(!shown[0].dismissible);

        // First recovery after 2s fails, second after a further 4s succeeds
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(orchestrator.state(), InitState::FallbackMode);
        tokio::time::sleep(Duration::from_millis(4_100)).await;

        assert_eq!(orchestrator.state(), InitState::Complete);
        assert_eq!(store.get("width"), Some(json!(200)));
        assert!(orchestrator.report().is_complete());
        assert_eq!(tier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_failure_is_read_only_without_retry() {
        let tier = Arc::new(Scripted::new(
            usize::MAX,
            SyncError::Storage(StorageError::PermissionDenied("nope".into())),
            SettingsMap::new(),
        ));
        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(tier);
        let (_, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(orchestrator);

        let report = orchestrator.initialize().await;
        assert!(report.read_only);
        assert!(orchestrator.is_read_only());
        assert!(!orchestrator.recovery_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_budget_is_finite() {
        let tier = Arc::new(Scripted::new(
            usize::MAX,
            SyncError::Timeout(Duration::from_secs(1)),
            SettingsMap::new(),
        ));
        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(tier.clone());
        let (_, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(orchestrator);

        orchestrator.initialize().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(orchestrator.state(), InitState::FallbackMode);
        assert!(!orchestrator.recovery_pending());
        // Initial attempt plus the default budget of five
        assert_eq!(tier.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_tier_win_schedules_upgrade_that_spares_unsaved_edits() {
        let remote = Arc::new(Scripted::new(
            2,
            SyncError::Network("down".into()),
            values(&[("a", json!("remote")), ("b", json!("remote"))]),
        ));
        let loader = MultiTierLoader::new(Duration::from_secs(5))
            .with_tier(remote.clone())
            .with_tier(Arc::new(DefaultsTier::new(values(&[("a", json!("default")), ("b", json!("default"))]))));
        let (store, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(orchestrator);

        let report = orchestrator.initialize().await;
        assert_eq!(report.tier, Some(SourceTier::Default));
        assert!(orchestrator.upgrade_pending());

        store.set("b", json!("local"), ChangeOrigin::Local);

        // Upgrade attempt at 5s fails, the one at 10s succeeds
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(store.get("a"), Some(json!("remote")));
        assert_eq!(store.get("b"), Some(json!("local")));
        assert!(store.setting("a").unwrap().authoritative);
        assert!(orchestrator.report().authoritative);
        assert!(!orchestrator.upgrade_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_failure_enters_fallback() {
        struct Broken;
        impl UiRestorer for Broken {
            fn restore(&self, _settings: &SettingsMap) -> Result<(), String> {
                Err("widget tree missing".into())
            }
        }

        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(Arc::new(
            DefaultsTier::new(values(&[("a", json!(1)), ("b", json!(2))])),
        ));
        let (store, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(
            orchestrator
                .with_restorer(Arc::new(Broken))
                .with_defaults(values(&[("a", json!(0))])),
        );
        store.set("c", json!("edit"), ChangeOrigin::Local);

        let report = orchestrator.initialize().await;
        assert_eq!(report.state, InitState::FallbackMode);
        assert_eq!(report.failure.unwrap().kind, InitFailureKind::DataCorruption);
        assert!(!orchestrator.recovery_pending());
        // Loaded values are evicted, unsaved edits survive, defaults fill in
        assert_eq!(store.get("a"), Some(json!(0)));
        assert_eq!(store.get("b"), None);
        assert_eq!(store.get("c"), Some(json!("edit")));
        assert_eq!(report.loaded_keys, 1);
        orchestrator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fallback_keeps_cached_values_and_fills_gaps() {
        let tier = Arc::new(Scripted::new(
            usize::MAX,
            SyncError::Timeout(Duration::from_secs(1)),
            SettingsMap::new(),
        ));
        let loader = MultiTierLoader::new(Duration::from_secs(5)).with_tier(tier);
        let (store, orchestrator) = orchestrator(loader);
        let orchestrator = Arc::new(
            orchestrator.with_defaults(values(&[("a", json!("default")), ("b", json!("default"))])),
        );
        store.set("a", json!("cached"), ChangeOrigin::Hydrate(SourceTier::LocalPersistent));

        let report = orchestrator.initialize().await;
        assert_eq!(report.failure.unwrap().kind, InitFailureKind::Timeout);
        assert_eq!(store.get("a"), Some(json!("cached")));
        assert_eq!(store.get("b"), Some(json!("default")));
        assert_eq!(report.loaded_keys, 2);
        orchestrator.shutdown();
    }
}
