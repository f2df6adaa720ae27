#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the permission gate.
//!
//! Tests the full flow: grant → persist → check → usage log → display, plus
//! propagation across the host/mini-app boundary and store faults.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use callcap_core::config::PermissionConfig;
use callcap_core::envelope::{action, notify};
use callcap_host::link::{ChannelUplink, MiniAppLinks, UplinkRequest};
use callcap_host::permission::{Origin, PermissionGate, StaticSystemPermissions};
use callcap_host::storage::{
    Database, DatabaseError, GrantMap, PermissionRecord, PermissionStore, PermissionUsage,
    SqlitePermissionStore,
};

struct GateParts {
    gate: PermissionGate,
    links: MiniAppLinks,
    uplink_rx: mpsc::UnboundedReceiver<UplinkRequest>,
}

/// Gate over an in-memory `SQLite` store, keeping the store for inspection.
struct Fixture {
    gate: PermissionGate,
    store: SqlitePermissionStore,
    links: MiniAppLinks,
    uplink_rx: mpsc::UnboundedReceiver<UplinkRequest>,
}

fn gate_over(store: Arc<dyn PermissionStore>, config: PermissionConfig) -> GateParts {
    let links = MiniAppLinks::new();
    let (uplink, uplink_rx) = ChannelUplink::new();
    let gate = PermissionGate::new(
        store,
        links.clone(),
        Arc::new(uplink),
        Arc::new(StaticSystemPermissions::new(["CAMERA", "READ_PHONE_STATE"])),
        config,
    );
    GateParts {
        gate,
        links,
        uplink_rx,
    }
}

async fn fixture() -> Fixture {
    let store = SqlitePermissionStore::new(Database::open_in_memory().await.unwrap());
    let GateParts {
        gate,
        links,
        uplink_rx,
    } = gate_over(Arc::new(store.clone()), PermissionConfig::default());
    Fixture {
        gate,
        store,
        links,
        uplink_rx,
    }
}

fn grants(entries: &[(&str, bool)]) -> GrantMap {
    entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

#[tokio::test]
async fn unknown_app_has_no_grants() {
    let f = fixture().await;
    assert!(f.gate.get_grants("fresh-app").await.is_empty());
    assert!(
        !f.gate
            .check_and_record("fresh-app", &["MINIAPP_CAMERA"], true)
            .await
    );
    assert!(f.store.query_usage("fresh-app", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn saved_grants_are_read_back() {
    let f = fixture().await;
    let update = grants(&[("MINIAPP_CAMERA", true), ("MINIAPP_LOCATION", false)]);
    f.gate
        .save_permission("maps", &update, Origin::Host, "call-1")
        .await;

    assert_eq!(f.gate.get_grants("maps").await, update);
    let stored = f.store.get_one("maps").await.unwrap().unwrap();
    assert_eq!(stored.grants().unwrap(), update);
}

#[tokio::test]
async fn saving_the_same_grants_twice_is_idempotent() {
    let f = fixture().await;
    let update = grants(&[("MINIAPP_CAMERA", true)]);
    f.gate
        .save_permission("maps", &update, Origin::Host, "call-1")
        .await;
    f.gate
        .save_permission("maps", &update, Origin::Host, "call-1")
        .await;

    assert_eq!(f.gate.get_grants("maps").await, update);
    assert_eq!(f.store.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn later_saves_merge_over_earlier_ones() {
    let f = fixture().await;
    f.gate
        .save_permission("maps", &grants(&[("MINIAPP_CAMERA", true)]), Origin::Host, "c")
        .await;
    f.gate
        .save_permission(
            "maps",
            &grants(&[("MINIAPP_LOCATION", true), ("MINIAPP_CAMERA", false)]),
            Origin::Host,
            "c",
        )
        .await;

    assert_eq!(
        f.gate.get_grants("maps").await,
        grants(&[("MINIAPP_CAMERA", false), ("MINIAPP_LOCATION", true)])
    );
}

#[tokio::test]
async fn granted_check_records_one_usage_per_permission() {
    let f = fixture().await;
    f.gate
        .save_permission(
            "maps",
            &grants(&[("MINIAPP_CAMERA", true), ("MINIAPP_LOCATION", true)]),
            Origin::Host,
            "call-1",
        )
        .await;

    assert!(
        f.gate
            .check_and_record("maps", &["MINIAPP_CAMERA", "MINIAPP_LOCATION"], true)
            .await
    );
    assert_eq!(f.store.database().count_permission_usage("maps").await.unwrap(), 2);

    // Not recording leaves the log alone.
    assert!(f.gate.check_and_record("maps", &["MINIAPP_CAMERA"], false).await);
    assert_eq!(f.store.database().count_permission_usage("maps").await.unwrap(), 2);
}

#[tokio::test]
async fn denied_check_records_nothing() {
    let f = fixture().await;
    f.gate
        .save_permission(
            "maps",
            &grants(&[("MINIAPP_CAMERA", true), ("MINIAPP_LOCATION", false)]),
            Origin::Host,
            "call-1",
        )
        .await;

    assert!(
        !f.gate
            .check_and_record("maps", &["MINIAPP_CAMERA", "MINIAPP_LOCATION"], true)
            .await
    );
    assert_eq!(f.store.database().count_permission_usage("maps").await.unwrap(), 0);
}

#[tokio::test]
async fn usage_within_the_same_minute_is_shown_once() {
    let f = fixture().await;
    let minute = 1_700_000_040_000_i64;
    for (name, at) in [
        ("MINIAPP_CAMERA", minute + 1_000),
        ("MINIAPP_CAMERA", minute + 30_000),
        ("MINIAPP_CAMERA", minute + 61_000),
        ("MINIAPP_LOCATION", minute + 2_000),
        ("MINIAPP_TELEPORT", minute + 3_000),
    ] {
        f.store.append_usage("maps", name, at).await.unwrap();
    }

    let usage = f.gate.get_usage("maps", minute).await;
    let shown: Vec<(&str, i64)> = usage
        .iter()
        .map(|u| (u.title.as_str(), u.used_at_ms))
        .collect();
    assert_eq!(
        shown,
        vec![
            ("Camera", minute + 61_000),
            ("Camera", minute + 30_000),
            ("Location", minute + 2_000),
        ]
    );

    // Only entries strictly after `since` count.
    assert_eq!(f.gate.get_usage("maps", minute + 61_000).await.len(), 0);
}

#[tokio::test]
async fn host_origin_save_notifies_the_attached_mini_app() {
    let f = fixture().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    f.links.attach("call-1", "maps", Arc::new(tx)).await;

    f.gate
        .save_permission("maps", &grants(&[("MINIAPP_CAMERA", true)]), Origin::Host, "call-1")
        .await;

    let event: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(event["action"], notify::REFRESH_MINI_PERMISSION);
    assert_eq!(event["params"]["appId"], "maps");
    assert_eq!(event["params"]["permissions"]["MINIAPP_CAMERA"], true);
}

#[tokio::test]
async fn mini_app_origin_save_is_forwarded_to_the_host() {
    let mut f = fixture().await;
    f.gate
        .save_permission(
            "maps",
            &grants(&[("MINIAPP_LOCATION", true)]),
            Origin::MiniApp,
            "call-1",
        )
        .await;

    let forwarded = f.uplink_rx.recv().await.unwrap();
    assert_eq!(forwarded.call_id, "call-1");
    assert_eq!(forwarded.request.action, action::REFRESH_PERMISSION);
    assert_eq!(forwarded.request.param_str("appId"), Some("maps"));
}

#[tokio::test]
async fn grants_survive_a_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("permissions.db");
    let update = grants(&[("MINIAPP_BLUETOOTH", true)]);

    {
        let store = SqlitePermissionStore::new(Database::open(&path).await.unwrap());
        let f = gate_over(Arc::new(store), PermissionConfig::default());
        f.gate
            .save_permission("speaker", &update, Origin::Host, "call-1")
            .await;
        assert!(
            f.gate
                .check_and_record("speaker", &["MINIAPP_BLUETOOTH"], true)
                .await
        );
    }

    let store = SqlitePermissionStore::new(Database::open(&path).await.unwrap());
    let f = gate_over(Arc::new(store.clone()), PermissionConfig::default());
    assert!(!f.gate.is_cached("speaker").await);
    assert_eq!(f.gate.get_grants("speaker").await, update);
    assert_eq!(store.query_usage("speaker", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn follower_picks_up_writes_from_another_gate() {
    let f = fixture().await;
    let follower = gate_over(Arc::new(f.store.clone()), PermissionConfig::default());
    let task = follower.gate.spawn_store_follower();

    f.gate
        .save_permission("maps", &grants(&[("MINIAPP_CAMERA", true)]), Origin::Host, "c")
        .await;

    let mut seen = false;
    for _ in 0..50 {
        if follower.gate.is_cached("maps").await {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen);
    assert_eq!(
        follower.gate.get_grants("maps").await,
        grants(&[("MINIAPP_CAMERA", true)])
    );
    task.abort();
}

#[tokio::test]
async fn system_permissions_come_from_the_checker() {
    let f = fixture().await;
    assert!(f.gate.is_system_permission_granted("CAMERA"));
    assert!(!f.gate.is_system_permission_granted("RECORD_AUDIO"));
}

/// Store whose reads never finish in time.
struct StalledStore {
    updates: broadcast::Sender<PermissionRecord>,
}

impl StalledStore {
    fn new() -> Self {
        Self {
            updates: broadcast::channel(4).0,
        }
    }
}

#[async_trait]
impl PermissionStore for StalledStore {
    async fn get_all(&self) -> Result<Vec<PermissionRecord>, DatabaseError> {
        Ok(Vec::new())
    }

    async fn get_one(&self, app_id: &str) -> Result<Option<PermissionRecord>, DatabaseError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let all_granted: HashMap<String, bool> =
            HashMap::from([("MINIAPP_CAMERA".to_string(), true)]);
        Ok(Some(PermissionRecord::from_grants(app_id, &all_granted, 0)?))
    }

    async fn upsert(&self, _record: PermissionRecord) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn append_usage(
        &self,
        _app_id: &str,
        _permission_name: &str,
        _used_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn query_usage(
        &self,
        _app_id: &str,
        _since_ms: Option<i64>,
    ) -> Result<Vec<PermissionUsage>, DatabaseError> {
        Err(DatabaseError::Connection("store offline".into()))
    }

    fn updates(&self) -> BroadcastStream<PermissionRecord> {
        BroadcastStream::new(self.updates.subscribe())
    }
}

#[tokio::test]
async fn slow_store_fails_closed() {
    let config = PermissionConfig {
        load_timeout_ms: 50,
        ..PermissionConfig::default()
    };
    let f = gate_over(Arc::new(StalledStore::new()), config);

    let started = tokio::time::Instant::now();
    assert!(
        !f.gate
            .check_and_record("maps", &["MINIAPP_CAMERA"], true)
            .await
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!f.gate.is_cached("maps").await);
}

#[tokio::test]
async fn usage_query_fault_shows_nothing() {
    let f = gate_over(Arc::new(StalledStore::new()), PermissionConfig::default());
    assert!(f.gate.recent_usage("maps").await.is_empty());
}

/// `SQLite` store whose first upsert is held back, so a later save can
/// overtake it.
struct SlowFirstUpsert {
    inner: SqlitePermissionStore,
    delayed: AtomicBool,
}

#[async_trait]
impl PermissionStore for SlowFirstUpsert {
    async fn get_all(&self) -> Result<Vec<PermissionRecord>, DatabaseError> {
        self.inner.get_all().await
    }

    async fn get_one(&self, app_id: &str) -> Result<Option<PermissionRecord>, DatabaseError> {
        self.inner.get_one(app_id).await
    }

    async fn upsert(&self, record: PermissionRecord) -> Result<(), DatabaseError> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.upsert(record).await
    }

    async fn append_usage(
        &self,
        app_id: &str,
        permission_name: &str,
        used_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        self.inner.append_usage(app_id, permission_name, used_at_ms).await
    }

    async fn query_usage(
        &self,
        app_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<PermissionUsage>, DatabaseError> {
        self.inner.query_usage(app_id, since_ms).await
    }

    fn updates(&self) -> BroadcastStream<PermissionRecord> {
        self.inner.updates()
    }
}

#[tokio::test]
async fn concurrent_saves_leave_cache_and_store_equal() {
    let inner = SqlitePermissionStore::new(Database::open_in_memory().await.unwrap());
    let store = SlowFirstUpsert {
        inner: inner.clone(),
        delayed: AtomicBool::new(false),
    };
    let f = gate_over(Arc::new(store), PermissionConfig::default());
    let follower = f.gate.spawn_store_follower();

    let camera = grants(&[("MINIAPP_CAMERA", true)]);
    let vibrate = grants(&[("MINIAPP_VIBRATE", true)]);
    tokio::join!(
        f.gate.save_permission("maps", &camera, Origin::Host, "c"),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.gate
                .save_permission("maps", &vibrate, Origin::Host, "c")
                .await;
        },
    );
    // Let the follower see both published records.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let both = grants(&[("MINIAPP_CAMERA", true), ("MINIAPP_VIBRATE", true)]);
    assert_eq!(f.gate.get_grants("maps").await, both);
    let stored = inner.get_one("maps").await.unwrap().unwrap();
    assert_eq!(stored.grants().unwrap(), both);
    follower.abort();
}

#[tokio::test]
async fn follower_does_not_roll_back_local_saves() {
    let f = fixture().await;
    let follower = f.gate.spawn_store_follower();

    let names = ["MINIAPP_CAMERA", "MINIAPP_VIBRATE", "MINIAPP_LOCATION", "MINIAPP_BLUETOOTH"];
    for name in names {
        f.gate
            .save_permission("maps", &grants(&[(name, true)]), Origin::Host, "c")
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let expected: GrantMap = names.iter().map(|n| ((*n).to_string(), true)).collect();
    assert_eq!(f.gate.get_grants("maps").await, expected);
    let stored = f.store.get_one("maps").await.unwrap().unwrap();
    assert_eq!(stored.grants().unwrap(), expected);
    follower.abort();
}
