use prefsync_core::{SettingsMap, SourceTier, StorageError, SyncError};
use prefsync_engine::collaborators::UiRestorer;
use prefsync_engine::snapshot::{MemorySnapshotStorage, SnapshotStorage};
use prefsync_engine::{InitFailureKind, InitState, SyncEngine};
use prefsync_test_utils::{
    default_settings, fast_config, map, RecordingNotifier, RejectingValidator, ScriptedBackend, Step,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn network_down() -> Step {
    Step::Fail(SyncError::Network("unreachable".into()))
}

#[tokio::test(start_paused = true)]
async fn test_remote_load_is_authoritative_and_cached() {
    let backend = ScriptedBackend::with_data(map(&[("menu_color", json!("#123456"))]));
    let local = Arc::new(MemorySnapshotStorage::new());
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .local_snapshot(local.clone())
        .defaults(default_settings())
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert!(report.is_complete());
    assert!(report.authoritative);
    assert_eq!(report.tier, Some(SourceTier::Remote));
    assert_eq!(engine.get("menu_color"), Some(json!("#123456")));
    assert_eq!(engine.stats().startup_tier, Some(SourceTier::Remote));

    let cached = local.document().unwrap();
    assert_eq!(cached.sync_source, SourceTier::Remote);
    assert_eq!(cached.settings["menu_color"], json!("#123456"));
}

#[tokio::test(start_paused = true)]
async fn test_local_snapshot_serves_when_remote_fails_then_upgrades() {
    let backend = ScriptedBackend::with_data(map(&[("x", json!(9))]));
    backend.push([network_down()]);
    let local = Arc::new(
        MemorySnapshotStorage::new().with_settings(map(&[("x", json!(5))]), SourceTier::Remote),
    );
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .local_snapshot(local.clone())
        .defaults(default_settings())
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert!(report.is_complete());
    assert!(!report.authoritative);
    assert_eq!(report.tier, Some(SourceTier::LocalPersistent));
    assert_eq!(engine.get("x"), Some(json!(5)));
    assert!(engine.orchestrator().upgrade_pending());

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(engine.get("x"), Some(json!(9)));
    assert!(engine.init_report().authoritative);
    assert_eq!(local.document().unwrap().settings["x"], json!(9));
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_spares_unsaved_edits() {
    let backend = ScriptedBackend::with_data(map(&[("x", json!(9)), ("y", json!(1))]));
    backend.push([network_down()]);
    let local = Arc::new(MemorySnapshotStorage::new().with_settings(
        map(&[("x", json!(5)), ("y", json!(0))]),
        SourceTier::Remote,
    ));
    let engine = SyncEngine::builder()
        .config(fast_config().with_debounce(Duration::from_secs(60)))
        .backend(backend.clone(), "token")
        .local_snapshot(local)
        .build()
        .unwrap();
    engine.initialize().await;

    engine.edit("x", json!(7)).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(engine.get("x"), Some(json!(7)));
    assert_eq!(engine.get("y"), Some(json!(1)));
    assert_eq!(engine.unsaved_keys(), vec!["x"]);
}

#[tokio::test(start_paused = true)]
async fn test_defaults_serve_when_nothing_else_answers() {
    let backend = ScriptedBackend::new();
    backend.push([network_down()]);
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .defaults(default_settings())
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert!(report.is_complete());
    assert_eq!(report.tier, Some(SourceTier::Default));
    assert_eq!(engine.snapshot(), default_settings());
    assert!(!engine.has_unsaved_changes());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_loaded_value_reverts_to_default() {
    let backend = ScriptedBackend::with_data(map(&[("menu_width", json!(-1)), ("font_size", json!(12))]));
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .defaults(default_settings())
        .validator(RejectingValidator::new("menu_width", json!(-1)))
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert!(report.is_complete());
    assert_eq!(report.invalid_keys, vec!["menu_width"]);
    assert_eq!(engine.get("menu_width"), Some(json!(240)));
    assert_eq!(engine.get("font_size"), Some(json!(12)));
}

#[tokio::test(start_paused = true)]
async fn test_total_failure_enters_fallback_and_recovers() {
    let backend = ScriptedBackend::with_data(map(&[("menu_color", json!("#abcdef"))]));
    backend.push([network_down(), network_down()]);
    let notifier = RecordingNotifier::new();
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .notifier(notifier.clone())
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert_eq!(report.state, InitState::FallbackMode);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, InitFailureKind::Network);
    assert!(failure.all_tiers_failed);
    assert!(!engine.is_read_only());
    assert_eq!(notifier.errors().len(), 1);
    assert!(!notifier.errors()[0].dismissible);

    // First recovery at 2 s fails, second at 2 s + 4 s succeeds
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.state(), InitState::FallbackMode);
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(engine.state(), InitState::Complete);
    assert_eq!(engine.get("menu_color"), Some(json!("#abcdef")));
    assert_eq!(notifier.infos().len(), 1);
}

/// Refuses to restore any UI state containing `"bad"`
struct PickyRestorer;

impl UiRestorer for PickyRestorer {
    fn restore(&self, settings: &SettingsMap) -> Result<(), String> {
        match settings.iter().find(|(_, v)| **v == json!("bad")) {
            Some((key, _)) => Err(format!("cannot apply {key}")),
            None => Ok(()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unrestorable_data_is_replaced_by_defaults() {
    let backend = ScriptedBackend::with_data(map(&[("menu_color", json!("bad")), ("extra", json!(1))]));
    let notifier = RecordingNotifier::new();
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .defaults(default_settings())
        .restorer(Arc::new(PickyRestorer))
        .notifier(notifier.clone())
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert_eq!(report.state, InitState::FallbackMode);
    assert_eq!(report.failure.unwrap().kind, InitFailureKind::DataCorruption);
    assert_eq!(engine.snapshot(), default_settings());
    assert_eq!(report.loaded_keys, 3);
    assert!(!engine.has_unsaved_changes());
    assert!(!engine.orchestrator().recovery_pending());
    assert_eq!(notifier.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_failure_makes_engine_read_only() {
    let backend = ScriptedBackend::new();
    backend.push([Step::Fail(SyncError::Storage(StorageError::PermissionDenied(
        "session expired".into(),
    )))]);
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .build()
        .unwrap();

    let report = engine.initialize().await;

    assert_eq!(report.state, InitState::FallbackMode);
    assert!(report.read_only);
    assert!(engine.is_read_only());
    assert!(matches!(engine.edit("menu_color", json!("#fff")), Err(SyncError::ReadOnly)));
    assert!(!engine.orchestrator().recovery_pending());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initialize_runs_once() {
    let backend = ScriptedBackend::with_data(default_settings());
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .build()
        .unwrap();

    let (a, b) = tokio::join!(engine.initialize(), engine.initialize());
    let again = engine.initialize().await;

    assert_eq!(a, b);
    assert_eq!(a, again);
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_file_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let backend = ScriptedBackend::with_data(map(&[("font_size", json!(18))]));

    let first = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .local_snapshot(Arc::new(prefsync_engine::FileSnapshotStorage::new(path.clone())))
        .build()
        .unwrap();
    first.initialize().await;
    first.shutdown().await;

    let offline = ScriptedBackend::new();
    offline.push([network_down()]);
    let local: Arc<dyn SnapshotStorage> = Arc::new(prefsync_engine::FileSnapshotStorage::new(path));
    let second = SyncEngine::builder()
        .config(fast_config())
        .backend(offline, "token")
        .local_snapshot(local)
        .build()
        .unwrap();
    let report = second.initialize().await;

    assert_eq!(report.tier, Some(SourceTier::LocalPersistent));
    assert_eq!(second.get("font_size"), Some(json!(18)));
}
