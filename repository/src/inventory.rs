use crate::keys;
use cache::{CacheError, MemoizeCache};
use domain::message::{SseMessage, msg_domain};
use domain::model::{AuthApiKey, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The known config assets for one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvAssets {
    pub flags: BTreeSet<String>,
    pub segments: BTreeSet<String>,
    pub api_keys: BTreeSet<String>,
}

type Inventory = BTreeMap<String, EnvAssets>;

/// What a cleanup pass found: delete notifications to publish and stale auth
/// records the caller should remove.
#[derive(Debug, Default)]
pub struct CleanupResult {
    pub notifications: Vec<SseMessage>,
    pub stale_auth_keys: Vec<AuthApiKey>,
    pub removed_environments: Vec<String>,
}

/// Tracks the set of known config-asset identifiers per environment so a
/// refresh can diff against the previous fetch and produce delete
/// notifications for anything that disappeared upstream.
#[derive(Clone)]
pub struct InventoryRepo {
    cache: MemoizeCache,
}

impl InventoryRepo {
    pub fn new(cache: MemoizeCache) -> Self {
        InventoryRepo { cache }
    }

    /// Diffs the freshly fetched config against the stored inventory, stores
    /// the new inventory, and reports what went away.
    pub async fn cleanup(&self, config: &[ProxyConfig]) -> Result<CleanupResult, CacheError> {
        let new_inventory = build_inventory(config);
        let old_inventory = self
            .cache
            .get::<Inventory>(keys::INVENTORY)
            .await?
            .unwrap_or_default();

        let mut result = CleanupResult::default();

        for (env, old_assets) in &old_inventory {
            let new_assets = new_inventory.get(env);
            if new_assets.is_none() {
                result.removed_environments.push(env.clone());
            }
            let empty = EnvAssets::default();
            let new_assets = new_assets.unwrap_or(&empty);

            for flag in old_assets.flags.difference(&new_assets.flags) {
                result
                    .notifications
                    .push(SseMessage::deleted(msg_domain::FLAG, flag, env));
            }
            for segment in old_assets.segments.difference(&new_assets.segments) {
                result.notifications.push(SseMessage::deleted(
                    msg_domain::TARGET_SEGMENT,
                    segment,
                    env,
                ));
            }
            for key in old_assets.api_keys.difference(&new_assets.api_keys) {
                result.stale_auth_keys.push(AuthApiKey(key.clone()));
            }
        }

        if !result.notifications.is_empty() || !result.stale_auth_keys.is_empty() {
            tracing::debug!(
                deleted_assets = result.notifications.len(),
                stale_keys = result.stale_auth_keys.len(),
                removed_environments = result.removed_environments.len(),
                "inventory diff found stale config assets"
            );
        }

        self.cache.set(keys::INVENTORY, &new_inventory).await?;
        Ok(result)
    }
}

fn build_inventory(config: &[ProxyConfig]) -> Inventory {
    let mut inventory = Inventory::new();
    for page in config {
        for env in &page.environments {
            let assets = inventory.entry(env.id.clone()).or_default();
            assets
                .flags
                .extend(env.feature_configs.iter().map(|f| f.feature.clone()));
            assets
                .segments
                .extend(env.segments.iter().map(|s| s.identifier.clone()));
            assets.api_keys.extend(
                env.api_keys
                    .iter()
                    .map(|k| AuthApiKey::new(k).as_str().to_string()),
            );
        }
    }
    inventory
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{MemoryCache, NoOpMemoizeMetrics};
    use domain::message::msg_event;
    use domain::model::{Environment, FeatureConfig, Segment};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_repo() -> InventoryRepo {
        InventoryRepo::new(MemoizeCache::new(
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Arc::new(NoOpMemoizeMetrics),
        ))
    }

    fn config(flags: &[&str], segments: &[&str], api_keys: &[&str]) -> Vec<ProxyConfig> {
        vec![ProxyConfig {
            environments: vec![Environment {
                id: "env-1".to_string(),
                identifier: "production".to_string(),
                api_keys: api_keys.iter().map(|k| k.to_string()).collect(),
                feature_configs: flags
                    .iter()
                    .map(|f| FeatureConfig {
                        feature: f.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                segments: segments
                    .iter()
                    .map(|s| Segment {
                        identifier: s.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            }],
        }]
    }

    #[tokio::test]
    async fn first_cleanup_reports_nothing() {
        let repo = new_repo();
        let result = repo
            .cleanup(&config(&["flag-a"], &["seg-a"], &["key-a"]))
            .await
            .unwrap();
        assert!(result.notifications.is_empty());
        assert!(result.stale_auth_keys.is_empty());
    }

    #[tokio::test]
    async fn dropped_assets_produce_delete_notifications() {
        let repo = new_repo();
        repo.cleanup(&config(&["flag-a", "flag-b"], &["seg-a"], &["key-a"]))
            .await
            .unwrap();

        let result = repo
            .cleanup(&config(&["flag-a"], &[], &["key-a"]))
            .await
            .unwrap();

        assert_eq!(result.notifications.len(), 2);
        let flag_delete = result
            .notifications
            .iter()
            .find(|n| n.domain == msg_domain::FLAG)
            .unwrap();
        assert_eq!(flag_delete.event, msg_event::DELETE);
        assert_eq!(flag_delete.identifier, "flag-b");
        assert_eq!(flag_delete.environments, vec!["env-1".to_string()]);

        let segment_delete = result
            .notifications
            .iter()
            .find(|n| n.domain == msg_domain::TARGET_SEGMENT)
            .unwrap();
        assert_eq!(segment_delete.identifier, "seg-a");
    }

    #[tokio::test]
    async fn removed_environment_reports_stale_keys() {
        let repo = new_repo();
        repo.cleanup(&config(&["flag-a"], &[], &["key-a"]))
            .await
            .unwrap();

        let result = repo.cleanup(&[]).await.unwrap();
        assert_eq!(result.removed_environments, vec!["env-1".to_string()]);
        assert_eq!(result.stale_auth_keys, vec![AuthApiKey::new("key-a")]);
    }
}
