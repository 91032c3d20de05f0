//! External collaborators consumed by the engine
//!
//! Value validation, user-facing notices and UI restoration live outside
//! this crate. Each is a trait with a permissive default so the engine runs
//! headless.

use prefsync_core::{SettingValue, SettingsMap};

/// Result of validating one value
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Whether the value may enter the store
    pub valid: bool,
    /// Value to store in place of the submitted one
    pub sanitized_value: SettingValue,
    /// Reason for rejection
    pub error: Option<String>,
}

impl ValidationOutcome {
    /// Accept `value` unchanged
    #[inline]
    #[must_use]
    pub fn accept(value: SettingValue) -> Self {
        Self {
            valid: true,
            sanitized_value: value,
            error: None,
        }
    }

    /// Reject with a reason
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            sanitized_value: SettingValue::Null,
            error: Some(reason.into()),
        }
    }
}

/// Checks values before they enter the store
pub trait Validator: Send + Sync {
    /// Validate and optionally sanitize `value`
    fn validate(&self, key: &str, value: &SettingValue) -> ValidationOutcome;
}

/// Validator that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _key: &str, value: &SettingValue) -> ValidationOutcome {
        ValidationOutcome::accept(value.clone())
    }
}

/// A user-facing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Message text
    pub message: String,
    /// Keys involved, if any
    pub keys: Vec<String>,
    /// Whether the user may dismiss it
    pub dismissible: bool,
}

impl Notice {
    /// Create dismissible notice
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            keys: Vec::new(),
            dismissible: true,
        }
    }

    /// Attach keys
    #[inline]
    #[must_use]
    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Make the notice sticky
    #[inline]
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.dismissible = false;
        self
    }
}

/// Surfaces failures and successes to the user
pub trait Notifier: Send + Sync {
    /// Show an error notice
    fn show_error(&self, notice: Notice);

    /// Show an informational notice
    fn show_info(&self, notice: Notice);
}

/// Notifier that writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_error(&self, notice: Notice) {
        tracing::error!(keys = ?notice.keys, dismissible = notice.dismissible, "{}", notice.message);
    }

    fn show_info(&self, notice: Notice) {
        tracing::info!(keys = ?notice.keys, "{}", notice.message);
    }
}

/// Re-applies loaded settings to the interactive surface at startup
pub trait UiRestorer: Send + Sync {
    /// Restore UI state from `settings`
    ///
    /// # Errors
    /// Returns a description of what could not be restored
    fn restore(&self, settings: &SettingsMap) -> Result<(), String>;
}

/// Restorer for headless sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRestorer;

impl UiRestorer for NoopRestorer {
    fn restore(&self, _settings: &SettingsMap) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accept_all_passes_value_through() {
        let outcome = AcceptAll.validate("width", &json!(12));
        assert!(outcome.valid);
        assert_eq!(outcome.sanitized_value, json!(12));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn notice_builder() {
        let notice = Notice::new("offline")
            .with_keys(vec!["a".into()])
            .persistent();
        assert!(!notice.dismissible);
        assert_eq!(notice.keys, vec!["a"]);
    }
}
