use prefsync_core::SyncError;
use prefsync_engine::broadcast::{ChannelHub, SharedStorageArea, SharedStorageTransport, Transport};
use prefsync_engine::SyncEngine;
use prefsync_test_utils::{default_settings, fast_config, ScriptedBackend, Step};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn context(backend: &Arc<ScriptedBackend>, transport: Arc<dyn Transport>) -> Arc<SyncEngine> {
    let engine = SyncEngine::builder()
        .config(fast_config())
        .backend(backend.clone(), "token")
        .transport(transport)
        .defaults(default_settings())
        .build()
        .unwrap();
    engine.initialize().await;
    engine
}

#[tokio::test(start_paused = true)]
async fn test_committed_edit_reaches_sibling_without_echo() {
    let backend = ScriptedBackend::with_data(default_settings());
    let hub = ChannelHub::new();
    let a = context(&backend, Arc::new(hub.transport())).await;
    let b = context(&backend, Arc::new(hub.transport())).await;

    a.edit("menu_color", json!("#ff0000")).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(b.get("menu_color"), Some(json!("#ff0000")));
    assert!(!b.has_unsaved_changes());
    assert_eq!(backend.saves().len(), 1);

    let a_stats = a.stats();
    let b_stats = b.stats();
    assert_eq!(a_stats.broadcasts_sent, 1);
    assert_eq!(a_stats.echoes_suppressed, 1);
    assert_eq!(a_stats.broadcasts_applied, 0);
    assert_eq!(b_stats.broadcasts_applied, 1);
    assert_eq!(b_stats.broadcasts_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_storage_fallback_carries_changes() {
    let backend = ScriptedBackend::with_data(default_settings());
    let area = Arc::new(SharedStorageArea::new());
    let a = context(&backend, Arc::new(SharedStorageTransport::new(Arc::clone(&area)))).await;
    let b = context(&backend, Arc::new(SharedStorageTransport::new(Arc::clone(&area)))).await;

    b.edit("font_size", json!(20)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(a.get("font_size"), Some(json!(20)));
    assert_eq!(a.stats().broadcasts_applied, 1);
    assert_eq!(b.stats().broadcasts_applied, 0);
    assert_eq!(backend.saves().len(), 1);
    assert!(area.get_item(prefsync_engine::broadcast::BROADCAST_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_closed_context_stops_receiving() {
    let backend = ScriptedBackend::with_data(default_settings());
    let hub = ChannelHub::new();
    let a = context(&backend, Arc::new(hub.transport())).await;
    let b = context(&backend, Arc::new(hub.transport())).await;

    b.shutdown().await;
    a.edit("menu_width", json!(300)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(b.get("menu_width"), Some(json!(240)));
    assert_eq!(b.stats().broadcasts_applied, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sibling_value_supersedes_pending_retry() {
    let backend = ScriptedBackend::with_data(default_settings());
    let hub = ChannelHub::new();
    let a = context(&backend, Arc::new(hub.transport())).await;
    let b = context(&backend, Arc::new(hub.transport())).await;
    backend.push([Step::Fail(SyncError::Network("down".into()))]);

    // B's save fails at 400 ms and would retry at 1.4 s; A commits a newer value first
    b.edit("menu_width", json!(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    a.edit("menu_width", json!(200)).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(backend.data()["menu_width"], json!(200));
    assert_eq!(a.get("menu_width"), Some(json!(200)));
    assert_eq!(b.get("menu_width"), Some(json!(200)));
    assert_eq!(b.queue_len(), 0);
    assert!(!b.has_unsaved_changes());
    assert_eq!(backend.saves().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_ack_after_sibling_value_resends_current_value() {
    let backend = ScriptedBackend::with_data(default_settings());
    let hub = ChannelHub::new();
    let a = context(&backend, Arc::new(hub.transport())).await;
    let b = context(&backend, Arc::new(hub.transport())).await;
    backend.push([Step::Stall(Duration::from_secs(2))]);

    // B's save leaves at 400 ms and lands at 2.4 s, after A's newer value
    b.edit("menu_width", json!(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    a.edit("menu_width", json!(200)).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(backend.data()["menu_width"], json!(200));
    assert_eq!(a.get("menu_width"), Some(json!(200)));
    assert_eq!(b.get("menu_width"), Some(json!(200)));
    assert_eq!(b.queue_len(), 0);
    assert!(!a.has_unsaved_changes());
    assert!(!b.has_unsaved_changes());

    // The stale value is never announced to siblings
    let saves = backend.saves();
    assert_eq!(saves.len(), 3);
    assert_eq!(saves[2].request.key_values["menu_width"], json!(200));
    assert_eq!(b.stats().broadcasts_sent, 1);
}
