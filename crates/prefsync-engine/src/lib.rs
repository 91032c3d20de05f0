//! prefsync engine
//!
//! Keeps user settings consistent between a client session and a remote
//! persistence service:
//! - Edits are debounced per key and flushed in batches
//! - Failed batches are retried with exponential backoff; offline batches are
//!   parked until connectivity returns
//! - Committed changes are broadcast to sibling contexts
//! - Startup walks remote, local snapshot, session snapshot and defaults in
//!   order, and falls back to a degraded mode with background recovery
//!
//! # Example
//!
//! ```rust,ignore
//! use prefsync_engine::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let engine = SyncEngine::builder()
//!     .backend(backend, "session-token")
//!     .build()?;
//!
//! engine.initialize().await;
//! engine.edit("menu_color", json!("#ff0000"))?;
//! engine.flush_now().await;
//! assert!(!engine.has_unsaved_changes());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod backend;
pub mod broadcast;
pub mod collaborators;
pub mod engine;
pub mod gateway;
pub mod guard;
pub mod loader;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod stats;

pub use backend::{
    BackendAction, BackendRequest, BackendResponse, FlakyBackend, HttpBackend, InMemoryBackend,
    SettingsBackend,
};
pub use broadcast::{Broadcaster, ChannelHub, Receipt, SharedStorageTransport, Transport};
pub use collaborators::{Notice, Notifier, UiRestorer, ValidationOutcome, Validator};
pub use engine::{BuildError, SyncEngine, SyncEngineBuilder};
pub use gateway::{DeliveryObserver, DeliveryReport, PersistenceGateway};
pub use loader::{LoadOutcome, LoadTier, MultiTierLoader};
pub use orchestrator::{InitFailureKind, InitOrchestrator, InitReport, InitState, RecoveryPlan};
pub use resolver::{ConflictResolver, Resolution};
pub use scheduler::{BatchScheduler, FlushOutcome};
pub use snapshot::{FileSnapshotStorage, MemorySnapshotStorage, SnapshotDocument, SnapshotStorage};
pub use stats::SyncStats;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the sync engine
    pub use crate::{
        InMemoryBackend, InitState, Notice, Notifier, SettingsBackend, SyncEngine, SyncStats,
        Validator,
    };
    pub use prefsync_core::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
