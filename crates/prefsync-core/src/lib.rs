//! prefsync core
//!
//! Building blocks shared by every part of the settings synchronization engine:
//! - The data model (settings, pending changes, batches, context messages)
//! - The [`SettingStore`], the single read path for consumers
//! - The error taxonomy
//! - [`SyncConfig`] and the backoff schedule
//! - The [`TaskScheduler`] timer abstraction
//!
//! # Example
//!
//! ```rust
//! use prefsync_core::{ChangeOrigin, SettingStore};
//! use serde_json::json;
//!
//! let store = SettingStore::new();
//! store.subscribe(|change| println!("{} -> {}", change.key, change.value));
//! store.set("menu_color", json!("#ff0000"), ChangeOrigin::Local);
//!
//! assert_eq!(store.dirty_keys(), vec!["menu_color"]);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod store;
pub mod timer;
pub mod types;

pub use config::{backoff, SyncConfig};
pub use error::{ConfigError, FailureKind, StorageError, SyncError};
pub use store::{SettingStore, StoreChange, SubscriptionId};
pub use timer::{ScheduledTask, TaskScheduler, TokioScheduler};
pub use types::{
    is_valid_key, Batch, BatchId, ChangeOrigin, Conflict, ContextId, ContextMessage, MessageKind,
    PendingChange, ResolutionStrategy, Setting, SettingValue, SettingsMap, SourceTier,
    RESERVED_PREFIX,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with prefsync core types
    pub use crate::{
        Batch, ChangeOrigin, ContextId, ContextMessage, PendingChange, ResolutionStrategy,
        SettingStore, SettingValue, SettingsMap, SourceTier, SyncConfig, SyncError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
