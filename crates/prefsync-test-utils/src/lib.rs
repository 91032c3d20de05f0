//! Testing utilities for the prefsync workspace
//!
//! Scripted backends, recording collaborators and fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use prefsync_core::{SettingValue, SettingsMap, SyncConfig, SyncError};
use prefsync_engine::backend::{BackendAction, BackendRequest, BackendResponse, InMemoryBackend};
use prefsync_engine::collaborators::{Notice, Notifier, ValidationOutcome, Validator};
use prefsync_engine::SettingsBackend;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Build a settings map from literal pairs
pub fn map(pairs: &[(&str, SettingValue)]) -> SettingsMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Defaults shared by the integration tests
pub fn default_settings() -> SettingsMap {
    map(&[
        ("menu_color", serde_json::json!("#333333")),
        ("menu_width", serde_json::json!(240)),
        ("font_size", serde_json::json!(14)),
    ])
}

/// Timings used by most scenarios: 300 ms debounce, 1 s first retry
pub fn fast_config() -> SyncConfig {
    SyncConfig::new()
        .with_debounce(Duration::from_millis(300))
        .with_flush_interval(Duration::from_millis(100))
        .with_retry_delays(Duration::from_secs(1), Duration::from_secs(30))
        .with_max_retries(5)
        .with_request_timeout(Duration::from_secs(5))
}

/// What the next backend call does
#[derive(Debug, Clone)]
pub enum Step {
    /// Forward to the in-memory store
    Pass,
    /// Fail with this error without touching the store
    Fail(SyncError),
    /// Sleep, then forward
    Stall(Duration),
    /// Return this response without touching the store
    Respond(BackendResponse),
}

/// A call observed by [`ScriptedBackend`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub request: BackendRequest,
}

/// Backend that follows a script of outcomes, then passes every call
/// through to an [`InMemoryBackend`]
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    store: InMemoryBackend,
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_data(data: SettingsMap) -> Arc<Self> {
        Self::from_store(InMemoryBackend::new().with_data(data))
    }

    pub fn from_store(store: InMemoryBackend) -> Arc<Self> {
        Arc::new(Self {
            store,
            ..Self::default()
        })
    }

    /// Append steps to the script
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Save calls only
    pub fn saves(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request.action == BackendAction::Save)
            .cloned()
            .collect()
    }

    /// Stored values
    pub fn data(&self) -> SettingsMap {
        self.store.data()
    }
}

#[async_trait]
impl SettingsBackend for ScriptedBackend {
    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, SyncError> {
        self.calls.lock().push(RecordedCall {
            at: Instant::now(),
            request: request.clone(),
        });
        let step = self.script.lock().pop_front().unwrap_or(Step::Pass);
        match step {
            Step::Pass => Ok(self.store.handle(&request)),
            Step::Fail(error) => Err(error),
            Step::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.store.handle(&request))
            }
            Step::Respond(response) => Ok(response),
        }
    }
}

/// Notifier that keeps every notice
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    errors: Mutex<Vec<Notice>>,
    infos: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<Notice> {
        self.errors.lock().clone()
    }

    pub fn infos(&self) -> Vec<Notice> {
        self.infos.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn show_error(&self, notice: Notice) {
        self.errors.lock().push(notice);
    }

    fn show_info(&self, notice: Notice) {
        self.infos.lock().push(notice);
    }
}

/// Validator refusing one exact value for one key
#[derive(Debug, Clone)]
pub struct RejectingValidator {
    key: String,
    value: SettingValue,
}

impl RejectingValidator {
    pub fn new(key: &str, value: SettingValue) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            value,
        })
    }
}

impl Validator for RejectingValidator {
    fn validate(&self, key: &str, value: &SettingValue) -> ValidationOutcome {
        if key == self.key && *value == self.value {
            ValidationOutcome::reject(format!("{value} is not allowed for {key}"))
        } else {
            ValidationOutcome::accept(value.clone())
        }
    }
}
