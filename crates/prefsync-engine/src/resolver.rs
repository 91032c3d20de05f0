//! Conflict resolver
//!
//! Reconciles a batch update against the latest remote state. A key is
//! divergent when the remote value moved since this context last read it
//! and the update proposes something else again. Divergent keys are settled
//! by the requested [`ResolutionStrategy`]:
//! - `Merge`: deep-merge when both sides are objects, else the update wins
//! - `Overwrite`: the update wins
//! - `Skip`: the remote value is kept

use prefsync_core::{Conflict, ResolutionStrategy, SettingValue, SettingsMap, SyncError};

/// Outcome of resolving one batch update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Values to apply locally and persist
    pub values: SettingsMap,
    /// Remote values kept instead of the update (`Skip`)
    pub kept_remote: SettingsMap,
    /// Divergent keys and how they were settled
    pub conflicts: Vec<Conflict>,
}

/// Reconciles batch updates with concurrent remote changes
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    depth_limit: usize,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(32)
    }
}

impl ConflictResolver {
    /// Create resolver refusing merges nested deeper than `depth_limit`
    #[inline]
    #[must_use]
    pub fn new(depth_limit: usize) -> Self {
        Self { depth_limit }
    }

    /// Resolve `update` against `remote`, given the values last read from the backend
    ///
    /// # Errors
    /// [`SyncError::Conflict`] when a merge cannot be completed
    pub fn resolve(
        &self,
        update: &SettingsMap,
        remote: &SettingsMap,
        last_read: &SettingsMap,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, SyncError> {
        let mut resolution = Resolution::default();
        for (key, proposed) in update {
            let Some(current) = remote.get(key) else {
                resolution.values.insert(key.clone(), proposed.clone());
                continue;
            };
            let moved = last_read.get(key) != Some(current);
            if !moved || current == proposed {
                resolution.values.insert(key.clone(), proposed.clone());
                continue;
            }

            tracing::debug!(key, ?strategy, "concurrent modification detected");
            resolution.conflicts.push(Conflict {
                key: key.clone(),
                local_value: proposed.clone(),
                remote_value: current.clone(),
                resolution_strategy: strategy,
            });
            match strategy {
                ResolutionStrategy::Overwrite => {
                    resolution.values.insert(key.clone(), proposed.clone());
                }
                ResolutionStrategy::Skip => {
                    resolution.kept_remote.insert(key.clone(), current.clone());
                }
                ResolutionStrategy::Merge => {
                    let merged = self.merge(key, current, proposed)?;
                    resolution.values.insert(key.clone(), merged);
                }
            }
        }
        Ok(resolution)
    }

    /// Deep-merge `overlay` onto `base`
    ///
    /// # Errors
    /// [`SyncError::Conflict`] when nesting exceeds the depth limit
    pub fn merge(
        &self,
        key: &str,
        base: &SettingValue,
        overlay: &SettingValue,
    ) -> Result<SettingValue, SyncError> {
        self.merge_at(key, base, overlay, 0)
    }

    fn merge_at(
        &self,
        key: &str,
        base: &SettingValue,
        overlay: &SettingValue,
        depth: usize,
    ) -> Result<SettingValue, SyncError> {
        let (SettingValue::Object(base), SettingValue::Object(overlay)) = (base, overlay) else {
            return Ok(overlay.clone());
        };
        if depth >= self.depth_limit {
            return Err(SyncError::Conflict {
                key: key.to_string(),
                reason: format!("merge nested deeper than {} levels", self.depth_limit),
            });
        }
        let mut merged = base.clone();
        for (field, value) in overlay {
            let next = match merged.get(field) {
                Some(existing) => self.merge_at(key, existing, value, depth + 1)?,
                None => value.clone(),
            };
            merged.insert(field.clone(), next);
        }
        Ok(SettingValue::Object(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn map(pairs: &[(&str, SettingValue)]) -> SettingsMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn untouched_remote_is_not_a_conflict() {
        let last = map(&[("width", json!(100))]);
        let resolution = ConflictResolver::default()
            .resolve(&map(&[("width", json!(200))]), &last, &last, ResolutionStrategy::Skip)
            .unwrap();

        assert!(resolution.conflicts.is_empty());
        assert_eq!(resolution.values, map(&[("width", json!(200))]));
    }

    #[test]
    fn skip_keeps_remote_value() {
        let resolution = ConflictResolver::default()
            .resolve(
                &map(&[("width", json!(200))]),
                &map(&[("width", json!(300))]),
                &map(&[("width", json!(100))]),
                ResolutionStrategy::Skip,
            )
            .unwrap();

        assert_eq!(resolution.conflicts.len(), 1);
        assert!(resolution.values.is_empty());
        assert_eq!(resolution.kept_remote, map(&[("width", json!(300))]));
    }

    #[test]
    fn overwrite_uses_update() {
        let resolution = ConflictResolver::default()
            .resolve(
                &map(&[("width", json!(200))]),
                &map(&[("width", json!(300))]),
                &SettingsMap::new(),
                ResolutionStrategy::Overwrite,
            )
            .unwrap();

        assert_eq!(resolution.values, map(&[("width", json!(200))]));
        assert_eq!(resolution.conflicts[0].remote_value, json!(300));
    }

    #[test]
    fn merge_combines_structured_values() {
        let resolution = ConflictResolver::default()
            .resolve(
                &map(&[("menu", json!({"color": "#f00", "font": {"size": 14}}))]),
                &map(&[("menu", json!({"width": 200, "font": {"family": "serif"}}))]),
                &map(&[("menu", json!({}))]),
                ResolutionStrategy::Merge,
            )
            .unwrap();

        assert_eq!(
            resolution.values["menu"],
            json!({"color": "#f00", "width": 200, "font": {"size": 14, "family": "serif"}})
        );
    }

    #[test]
    fn merge_of_scalars_takes_update() {
        let resolver = ConflictResolver::default();
        assert_eq!(resolver.merge("k", &json!(1), &json!("x")).unwrap(), json!("x"));
        assert_eq!(resolver.merge("k", &json!({"a": 1}), &json!(2)).unwrap(), json!(2));
    }

    #[test]
    fn merge_too_deep_is_a_conflict() {
        let resolver = ConflictResolver::new(1);
        let err = resolver
            .merge("k", &json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
    }

    fn object() -> impl Strategy<Value = SettingValue> {
        prop::collection::btree_map("[a-c]", any::<i32>(), 0..4).prop_map(|fields| {
            SettingValue::Object(fields.into_iter().map(|(k, v)| (k, json!(v))).collect())
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(value in object()) {
            let resolver = ConflictResolver::default();
            prop_assert_eq!(resolver.merge("k", &value, &value).unwrap(), value);
        }

        #[test]
        fn empty_overlay_keeps_base(value in object()) {
            let resolver = ConflictResolver::default();
            prop_assert_eq!(resolver.merge("k", &value, &json!({})).unwrap(), value);
        }

        #[test]
        fn overlay_fields_always_win(base in object(), overlay in object()) {
            let resolver = ConflictResolver::default();
            let merged = resolver.merge("k", &base, &overlay).unwrap();
            for (field, value) in overlay.as_object().unwrap() {
                prop_assert_eq!(&merged[field], value);
            }
        }
    }
}
