//! Error types for settings synchronization
//!
//! Provides the error taxonomy shared by all components:
//! - Connectivity and timeout failures (retryable)
//! - Backend rejections (retryable)
//! - Validation rejections (never retried)
//! - Storage tier failures
//! - Conflicts and malformed responses

use std::time::Duration;

/// Main synchronization error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Connectivity lost
    #[error("network error: {0}")]
    Network(String),

    /// Call exceeded its deadline
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Backend rejected the call
    #[error("server error {code}: {message}")]
    Server {
        /// Backend error code
        code: String,
        /// Backend message
        message: String,
    },

    /// Rejected by the validator
    #[error("validation failed for '{key}': {reason}")]
    Validation {
        /// Setting key
        key: String,
        /// Why the value was refused
        reason: String,
    },

    /// A persistence tier is unavailable or over quota
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Concurrent modification could not be resolved
    #[error("conflict on '{key}': {reason}")]
    Conflict {
        /// Setting key
        key: String,
        /// Why resolution failed
        reason: String,
    },

    /// Malformed response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Edits refused while degraded
    #[error("settings are read-only until recovery completes")]
    ReadOnly,

    /// Engine already torn down
    #[error("sync engine is closed")]
    Closed,
}

impl SyncError {
    /// Create validation error
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create server error
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Gateway classification, if this error came from a round-trip
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Network(_) => Some(FailureKind::Network),
            Self::Timeout(_) => Some(FailureKind::Timeout),
            Self::Server { .. } | Self::Protocol(_) => Some(FailureKind::ServerError),
            Self::Validation { .. } => Some(FailureKind::Validation),
            _ => None,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_some_and(FailureKind::is_retryable)
    }
}

/// Classification of one failed round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connectivity lost
    Network,
    /// Deadline exceeded
    Timeout,
    /// Backend rejected or answered nonsense
    ServerError,
    /// Value refused; retrying cannot help
    Validation,
}

impl FailureKind {
    /// Whether the change should enter the retry queue
    #[inline]
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Validation)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ServerError => "serverError",
            Self::Validation => "validation",
        })
    }
}

/// Failures of a storage tier or snapshot store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Tier not reachable or not configured
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Write refused for lack of space
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Stored document could not be decoded
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    /// Access denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::NotFound => Self::Unavailable(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

impl ConfigError {
    /// Create invalid value error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
