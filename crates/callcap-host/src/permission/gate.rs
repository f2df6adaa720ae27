//! Cached permission gate over the permission store.

use std::collections::HashMap;
use std::sync::Arc;

use callcap_core::config::PermissionConfig;
use callcap_core::db::{unix_millis, unix_seconds};
use callcap_core::envelope::{action, notify, topic};
use callcap_core::{AppRequest, NotifyEvent};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, warn};

use super::types::{Origin, SystemPermissionChecker, UsageRecord};
use super::usage::dedupe_usage;
use crate::link::{HostUplink, MiniAppLinks};
use crate::storage::{DatabaseError, GrantMap, PermissionRecord, PermissionStore};

/// Permission gate: per-app grant cache plus usage log access.
///
/// An app's entry is loaded on first use and then lives for the process
/// lifetime. Writes to one app are serialized: merge, persist and cache
/// update happen under that app's write lock, so the store never ends up
/// behind the cache.
#[derive(Clone)]
pub struct PermissionGate {
    cache: Arc<RwLock<HashMap<String, GrantMap>>>,
    write_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    store: Arc<dyn PermissionStore>,
    links: MiniAppLinks,
    uplink: Arc<dyn HostUplink>,
    system: Arc<dyn SystemPermissionChecker>,
    config: PermissionConfig,
}

impl PermissionGate {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        links: MiniAppLinks,
        uplink: Arc<dyn HostUplink>,
        system: Arc<dyn SystemPermissionChecker>,
        config: PermissionConfig,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            write_locks: Arc::new(Mutex::new(HashMap::new())),
            store,
            links,
            uplink,
            system,
            config,
        }
    }

    async fn write_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.write_locks
                .lock()
                .await
                .entry(app_id.to_string())
                .or_default(),
        )
    }

    async fn load_from_store(&self, app_id: &str) -> Result<GrantMap, DatabaseError> {
        match self.store.get_one(app_id).await? {
            Some(record) => record.grants(),
            None => Ok(GrantMap::new()),
        }
    }

    /// Grant map of `app_id`, loading it from the store on first use.
    ///
    /// A missing record yields an empty map that is cached like any other.
    /// A store fault yields an empty map that is not cached.
    pub async fn get_grants(&self, app_id: &str) -> GrantMap {
        if let Some(grants) = self.cache.read().await.get(app_id) {
            return grants.clone();
        }

        match self.load_from_store(app_id).await {
            Ok(loaded) => {
                debug!(app_id, count = loaded.len(), "Permission map loaded");
                // A save that raced the load wins.
                self.cache
                    .write()
                    .await
                    .entry(app_id.to_string())
                    .or_insert(loaded)
                    .clone()
            }
            Err(e) => {
                error!(app_id, error = %e, "Failed to load permission map");
                GrantMap::new()
            }
        }
    }

    pub async fn is_cached(&self, app_id: &str) -> bool {
        self.cache.read().await.contains_key(app_id)
    }

    /// Whether every permission in `permissions` is granted to `app_id`.
    ///
    /// An uncached map must load within the configured timeout; otherwise
    /// the app is treated as having no grants. When the answer is `true`
    /// and `record` is set, one usage entry per permission is appended.
    pub async fn check_and_record<S: AsRef<str>>(
        &self,
        app_id: &str,
        permissions: &[S],
        record: bool,
    ) -> bool {
        let grants = match tokio::time::timeout(self.config.load_timeout(), self.get_grants(app_id))
            .await
        {
            Ok(grants) => grants,
            Err(_) => {
                warn!(
                    app_id,
                    timeout_ms = self.config.load_timeout_ms,
                    "Permission map load timed out, denying"
                );
                GrantMap::new()
            }
        };

        let granted = permissions
            .iter()
            .all(|p| grants.get(p.as_ref()).copied().unwrap_or(false));
        debug!(app_id, granted, count = permissions.len(), "Permission check");

        if granted && record {
            let now = unix_millis();
            for permission in permissions {
                let permission = permission.as_ref();
                if let Err(e) = self.store.append_usage(app_id, permission, now).await {
                    error!(app_id, permission, error = %e, "Failed to record permission usage");
                }
            }
        }
        granted
    }

    /// Merge `updates` into the app's grants, persist, then notify the
    /// other side of the boundary.
    ///
    /// A failed store write is logged; the cached map stays authoritative.
    pub async fn save_permission(
        &self,
        app_id: &str,
        updates: &GrantMap,
        origin: Origin,
        call_id: &str,
    ) {
        let lock = self.write_lock(app_id).await;
        let guard = lock.lock().await;

        let mut merged = self.get_grants(app_id).await;
        merged.extend(updates.iter().map(|(k, v)| (k.clone(), *v)));

        match PermissionRecord::from_grants(app_id, &merged, unix_seconds()) {
            Ok(record) => {
                if let Err(e) = self.store.upsert(record).await {
                    error!(app_id, error = %e, "Failed to persist permission map");
                }
            }
            Err(e) => error!(app_id, error = %e, "Failed to encode permission map"),
        }
        self.cache
            .write()
            .await
            .insert(app_id.to_string(), merged.clone());
        drop(guard);

        info!(app_id, call_id, updated = updates.len(), ?origin, "Permissions saved");

        match origin {
            Origin::Host => {
                let grants: serde_json::Map<String, Value> = merged
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Bool(*v)))
                    .collect();
                let event = NotifyEvent::new(notify::REFRESH_MINI_PERMISSION)
                    .with_param("appId", app_id)
                    .with_param("permissions", Value::Object(grants));
                self.links.notify_event(call_id, app_id, &event).await;
            }
            Origin::MiniApp => {
                let request = AppRequest::new(topic::COMMON_APP_EVENT, action::REFRESH_PERMISSION)
                    .with_param("appId", app_id);
                if let Err(e) = self.uplink.forward(call_id, app_id, request).await {
                    warn!(app_id, call_id, error = %e, "Failed to forward permission refresh");
                }
            }
        }
    }

    /// Reload the app's grants from the store, discarding cached edits.
    ///
    /// On a store fault the cached map is kept.
    pub async fn refresh_from_store(&self, app_id: &str) -> GrantMap {
        let lock = self.write_lock(app_id).await;
        let _guard = lock.lock().await;
        match self.load_from_store(app_id).await {
            Ok(loaded) => {
                self.cache
                    .write()
                    .await
                    .insert(app_id.to_string(), loaded.clone());
                debug!(app_id, count = loaded.len(), "Permission map refreshed");
                loaded
            }
            Err(e) => {
                error!(app_id, error = %e, "Failed to refresh permission map");
                self.cache.read().await.get(app_id).cloned().unwrap_or_default()
            }
        }
    }

    /// OS-level check. Never cached.
    pub fn is_system_permission_granted(&self, permission: &str) -> bool {
        self.system.is_granted(permission)
    }

    /// Display records of usage strictly after `since_ms`, newest first.
    pub async fn get_usage(&self, app_id: &str, since_ms: i64) -> Vec<UsageRecord> {
        match self.store.query_usage(app_id, Some(since_ms)).await {
            Ok(entries) => dedupe_usage(entries),
            Err(e) => {
                error!(app_id, error = %e, "Failed to query permission usage");
                Vec::new()
            }
        }
    }

    /// Usage within the configured rolling window.
    pub async fn recent_usage(&self, app_id: &str) -> Vec<UsageRecord> {
        let since = unix_millis() - self.config.usage_window_millis();
        self.get_usage(app_id, since).await
    }

    async fn seed_from_store(&self) {
        match self.store.get_all().await {
            Ok(records) => {
                for record in &records {
                    self.refresh_from_store(&record.app_id).await;
                }
                info!(apps = records.len(), "Permission cache seeded");
            }
            Err(e) => error!(error = %e, "Failed to seed permission cache"),
        }
    }

    /// Seed the cache from every stored record and keep it in step with
    /// writes published by the store.
    ///
    /// A published record only names the app that changed. Its grants are
    /// re-read under the app's write lock, so a notification that arrives
    /// after a newer local save cannot roll the cache back.
    pub fn spawn_store_follower(&self) -> JoinHandle<()> {
        let gate = self.clone();
        let mut updates = self.store.updates();
        tokio::spawn(async move {
            gate.seed_from_store().await;
            while let Some(update) = updates.next().await {
                match update {
                    Ok(record) => {
                        gate.refresh_from_store(&record.app_id).await;
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed, "Permission follower lagged, reseeding");
                        gate.seed_from_store().await;
                    }
                }
            }
            debug!("Permission store follower stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::link::ChannelUplink;
    use crate::permission::StaticSystemPermissions;
    use crate::storage::{Database, SqlitePermissionStore};

    async fn gate() -> (PermissionGate, SqlitePermissionStore) {
        let store = SqlitePermissionStore::new(Database::open_in_memory().await.unwrap());
        let (uplink, _rx) = ChannelUplink::new();
        let gate = PermissionGate::new(
            Arc::new(store.clone()),
            MiniAppLinks::new(),
            Arc::new(uplink),
            Arc::new(StaticSystemPermissions::new(["CAMERA"])),
            PermissionConfig::default(),
        );
        (gate, store)
    }

    fn grants(entries: &[(&str, bool)]) -> GrantMap {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn missing_record_is_empty_and_cached() {
        let (gate, _store) = gate().await;
        assert!(gate.get_grants("app1").await.is_empty());
        assert!(gate.is_cached("app1").await);
        assert!(!gate.check_and_record("app1", &["MINIAPP_CAMERA"], true).await);
    }

    #[tokio::test]
    async fn save_merges_over_stored_grants() {
        let (gate, store) = gate().await;
        store
            .upsert(PermissionRecord {
                app_id: "app1".into(),
                permission_map: r#"{"MINIAPP_CAMERA":true,"MINIAPP_VIBRATE":true}"#.into(),
                updated_at: 1,
            })
            .await
            .unwrap();

        gate.save_permission("app1", &grants(&[("MINIAPP_VIBRATE", false)]), Origin::Host, "c1")
            .await;

        let merged = gate.get_grants("app1").await;
        assert_eq!(merged, grants(&[("MINIAPP_CAMERA", true), ("MINIAPP_VIBRATE", false)]));

        let stored = store.get_one("app1").await.unwrap().unwrap().grants().unwrap();
        assert_eq!(stored, merged);
    }

    #[tokio::test]
    async fn refresh_discards_unpersisted_cache_edits() {
        let (gate, store) = gate().await;
        gate.get_grants("app1").await;
        store
            .upsert(PermissionRecord {
                app_id: "app1".into(),
                permission_map: r#"{"MINIAPP_LOCATION":true}"#.into(),
                updated_at: 2,
            })
            .await
            .unwrap();

        assert!(gate.get_grants("app1").await.is_empty());
        let refreshed = gate.refresh_from_store("app1").await;
        assert_eq!(refreshed, grants(&[("MINIAPP_LOCATION", true)]));
        assert!(gate.check_and_record("app1", &["MINIAPP_LOCATION"], false).await);
    }

    #[tokio::test]
    async fn system_permission_is_delegated() {
        let (gate, _store) = gate().await;
        assert!(gate.is_system_permission_granted("CAMERA"));
        assert!(!gate.is_system_permission_granted("RECORD_AUDIO"));
    }

    #[tokio::test]
    async fn follower_applies_store_writes() {
        let (gate, store) = gate().await;
        let follower = gate.spawn_store_follower();

        store
            .upsert(PermissionRecord {
                app_id: "app9".into(),
                permission_map: r#"{"MINIAPP_BLUETOOTH":true}"#.into(),
                updated_at: 3,
            })
            .await
            .unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if gate.is_cached("app9").await {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen);
        assert!(gate.check_and_record("app9", &["MINIAPP_BLUETOOTH"], false).await);
        follower.abort();
    }
}
