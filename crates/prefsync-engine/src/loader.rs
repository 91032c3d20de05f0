//! Multi-tier loader
//!
//! Startup hydration walks an ordered list of [`LoadTier`]s. Each attempt is
//! isolated (deadline plus panic boundary), so a tier that fails for any
//! reason is skipped and the chain continues. The first tier returning a
//! non-empty result wins.
//!
//! Standard order:
//! 1. [`RemoteTier`]: authoritative backend fetch, bypassing caches
//! 2. [`SnapshotTier`] over the local persistent snapshot
//! 3. [`SnapshotTier`] over the session snapshot
//! 4. [`DefaultsTier`]: built-in values

use crate::backend::{BackendRequest, SettingsBackend};
use crate::guard::isolated;
use crate::snapshot::SnapshotStorage;
use async_trait::async_trait;
use prefsync_core::{SettingsMap, SourceTier, SyncError};
use std::sync::Arc;
use std::time::Duration;

/// One source consulted during hydration
#[async_trait]
pub trait LoadTier: Send + Sync {
    /// Name for logs and reports
    fn name(&self) -> &'static str;

    /// Provenance recorded on values from this tier
    fn tier(&self) -> SourceTier;

    /// Whether values from this tier are confirmed by the backend
    fn authoritative(&self) -> bool {
        false
    }

    /// Fetch every setting this tier holds
    ///
    /// # Errors
    /// Any failure; the loader treats it as "tier unavailable"
    async fn attempt(&self) -> Result<SettingsMap, SyncError>;
}

/// Authoritative fetch from the backend
pub struct RemoteTier {
    backend: Arc<dyn SettingsBackend>,
    auth_token: String,
}

impl RemoteTier {
    /// Create tier
    #[must_use]
    pub fn new(backend: Arc<dyn SettingsBackend>, auth_token: impl Into<String>) -> Self {
        Self {
            backend,
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl LoadTier for RemoteTier {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Remote
    }

    fn authoritative(&self) -> bool {
        true
    }

    async fn attempt(&self) -> Result<SettingsMap, SyncError> {
        let response = self
            .backend
            .call(BackendRequest::load(self.auth_token.clone(), true))
            .await?;
        Ok(response.into_result()?.unwrap_or_default())
    }
}

/// Snapshot-backed tier (local persistent or session)
pub struct SnapshotTier {
    tier: SourceTier,
    storage: Arc<dyn SnapshotStorage>,
}

impl SnapshotTier {
    /// Local persistent snapshot
    #[must_use]
    pub fn local(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            tier: SourceTier::LocalPersistent,
            storage,
        }
    }

    /// Session-scoped snapshot
    #[must_use]
    pub fn session(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            tier: SourceTier::Session,
            storage,
        }
    }
}

#[async_trait]
impl LoadTier for SnapshotTier {
    fn name(&self) -> &'static str {
        match self.tier {
            SourceTier::Session => "session-snapshot",
            _ => "local-snapshot",
        }
    }

    fn tier(&self) -> SourceTier {
        self.tier
    }

    async fn attempt(&self) -> Result<SettingsMap, SyncError> {
        let document = self.storage.read().await?;
        Ok(document.map(|d| d.settings).unwrap_or_default())
    }
}

/// Built-in default values
#[derive(Debug, Clone, Default)]
pub struct DefaultsTier {
    defaults: SettingsMap,
}

impl DefaultsTier {
    /// Create tier
    #[inline]
    #[must_use]
    pub fn new(defaults: SettingsMap) -> Self {
        Self { defaults }
    }

    /// Default values
    #[inline]
    #[must_use]
    pub fn defaults(&self) -> &SettingsMap {
        &self.defaults
    }
}

#[async_trait]
impl LoadTier for DefaultsTier {
    fn name(&self) -> &'static str {
        "defaults"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Default
    }

    async fn attempt(&self) -> Result<SettingsMap, SyncError> {
        Ok(self.defaults.clone())
    }
}

/// A tier that failed during hydration
#[derive(Debug, Clone, PartialEq)]
pub struct TierFailure {
    /// Tier name
    pub name: &'static str,
    /// Tier provenance
    pub tier: SourceTier,
    /// Failure
    pub error: SyncError,
}

/// Result of walking the tier chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOutcome {
    /// Winning settings; empty when no tier produced data
    pub settings: SettingsMap,
    /// Winning tier
    pub tier: Option<SourceTier>,
    /// Whether the winning tier is authoritative
    pub authoritative: bool,
    /// Tiers that failed before (or instead of) a winner
    pub failures: Vec<TierFailure>,
    /// Tiers consulted
    pub attempted: usize,
}

impl LoadOutcome {
    /// Every consulted tier failed
    #[inline]
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.tier.is_none() && self.attempted > 0 && self.failures.len() == self.attempted
    }

    /// A tier other than the authoritative one won
    #[inline]
    #[must_use]
    pub fn needs_upgrade(&self) -> bool {
        !self.authoritative
    }
}

/// Walks tiers in order until one yields data
pub struct MultiTierLoader {
    tiers: Vec<Arc<dyn LoadTier>>,
    tier_timeout: Duration,
}

impl std::fmt::Debug for MultiTierLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTierLoader")
            .field("tiers", &self.tier_names())
            .field("tier_timeout", &self.tier_timeout)
            .finish()
    }
}

impl MultiTierLoader {
    /// Create loader with no tiers
    #[must_use]
    pub fn new(tier_timeout: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            tier_timeout,
        }
    }

    /// Append a tier (consulted after those already added)
    #[must_use]
    pub fn with_tier(mut self, tier: Arc<dyn LoadTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Names of the tiers, in order
    #[must_use]
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Walk the chain; never fails, at worst returns an empty outcome
    pub async fn load(&self) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        for tier in &self.tiers {
            outcome.attempted += 1;
            match isolated(self.tier_timeout, tier.attempt()).await {
                Ok(settings) if settings.is_empty() => {
                    tracing::debug!(tier = tier.name(), "tier empty, continuing");
                }
                Ok(settings) => {
                    tracing::info!(tier = tier.name(), keys = settings.len(), "tier hydrated settings");
                    outcome.settings = settings;
                    outcome.tier = Some(tier.tier());
                    outcome.authoritative = tier.authoritative();
                    return outcome;
                }
                Err(error) => {
                    tracing::warn!(tier = tier.name(), %error, "tier unavailable");
                    outcome.failures.push(TierFailure {
                        name: tier.name(),
                        tier: tier.tier(),
                        error,
                    });
                }
            }
        }
        if outcome.all_failed() {
            tracing::error!(tiers = outcome.attempted, "every tier failed");
        }
        outcome
    }

    /// Fetch from the first authoritative tier only
    ///
    /// # Errors
    /// [`SyncError::Protocol`] if no tier is authoritative, otherwise the tier's failure
    pub async fn fetch_authoritative(&self) -> Result<SettingsMap, SyncError> {
        let Some(tier) = self.tiers.iter().find(|t| t.authoritative()) else {
            return Err(SyncError::Protocol("no authoritative tier configured".to_string()));
        };
        isolated(self.tier_timeout, tier.attempt()).await
    }
}
