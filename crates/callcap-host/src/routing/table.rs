//! Subscription table and capability routing.
//!
//! Each subscription owns an unbounded outbox drained by its own delivery
//! task, so a slow or failing reply channel only ever delays itself.
//! Callbacks for one key are delivered in the order they were routed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{CapabilityEnvelope, payload_module, stamp_provider};
use super::types::{AllowList, ReplyChannel, SubscriptionKey};
use crate::provider::{HostContext, ProviderMessage, ProviderRegistry, STATUS_FAILED};

struct Subscription {
    allow: AllowList,
    outbox: mpsc::UnboundedSender<String>,
}

fn spawn_delivery(
    key: SubscriptionKey,
    channel: Arc<dyn ReplyChannel>,
) -> mpsc::UnboundedSender<String> {
    let (outbox, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let channel = Arc::clone(&channel);
            // Run each delivery in its own task so a panicking channel
            // loses only that payload.
            match tokio::spawn(async move { channel.deliver(payload).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    call_id = %key.call_id,
                    app_id = %key.app_id,
                    error = %e,
                    "Reply delivery failed"
                ),
                Err(e) => warn!(
                    call_id = %key.call_id,
                    app_id = %key.app_id,
                    error = %e,
                    "Reply channel panicked"
                ),
            }
        }
        debug!(call_id = %key.call_id, app_id = %key.app_id, "Delivery task finished");
    });
    outbox
}

/// Routing table shared by inbound requests, provider callbacks and
/// lifecycle calls.
#[derive(Clone)]
pub struct RoutingTable {
    subscriptions: Arc<RwLock<HashMap<SubscriptionKey, Subscription>>>,
    registry: ProviderRegistry,
    ctx: HostContext,
}

impl RoutingTable {
    pub fn new(registry: ProviderRegistry, ctx: HostContext) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            registry,
            ctx,
        }
    }

    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Install or replace the subscription for (`call_id`, `app_id`).
    pub async fn subscribe(
        &self,
        call_id: &str,
        app_id: &str,
        allow: AllowList,
        channel: Arc<dyn ReplyChannel>,
    ) {
        let key = SubscriptionKey::new(call_id, app_id);
        let outbox = spawn_delivery(key.clone(), channel);
        let replaced = self
            .subscriptions
            .write()
            .await
            .insert(key, Subscription { allow, outbox })
            .is_some();
        info!(call_id, app_id, replaced, "Capability subscription installed");
    }

    /// Remove the subscription and let every provider release app resources.
    ///
    /// In-flight provider calls are not cancelled; their late callbacks are
    /// dropped. Returns whether a subscription existed.
    pub async fn unsubscribe(&self, call_id: &str, app_id: &str) -> bool {
        let key = SubscriptionKey::new(call_id, app_id);
        let existed = self.subscriptions.write().await.remove(&key).is_some();
        self.registry.release_app(&self.ctx, call_id, app_id).await;
        info!(call_id, app_id, existed, "Capability subscription removed");
        existed
    }

    /// Unsubscribe every app of a call. Returns how many were removed.
    pub async fn unsubscribe_call(&self, call_id: &str) -> usize {
        let keys = self.keys_for_call(call_id).await;
        let mut removed = 0;
        for key in keys {
            if self.unsubscribe(&key.call_id, &key.app_id).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn keys_for_call(&self, call_id: &str) -> Vec<SubscriptionKey> {
        self.subscriptions
            .read()
            .await
            .keys()
            .filter(|k| k.call_id == call_id)
            .cloned()
            .collect()
    }

    pub async fn is_subscribed(&self, call_id: &str, app_id: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .contains_key(&SubscriptionKey::new(call_id, app_id))
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Forward a capability request from (`call_id`, `app_id`).
    ///
    /// The request reaches the provider only when its module is in the
    /// subscriber's allow-list for that provider. Every rejection returns
    /// `-1` with no further detail.
    pub async fn route(&self, call_id: &str, app_id: &str, envelope: &str) -> i32 {
        let envelope = match CapabilityEnvelope::parse(envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(call_id, app_id, error = %e, "Malformed capability request");
                return STATUS_FAILED;
            }
        };

        let allowed = self
            .subscriptions
            .read()
            .await
            .get(&SubscriptionKey::new(call_id, app_id))
            .is_some_and(|sub| sub.allow.allows(&envelope.provider, &envelope.module));
        if !allowed {
            debug!(call_id, app_id, "Capability request rejected");
            return STATUS_FAILED;
        }

        debug!(
            call_id,
            app_id,
            provider = %envelope.provider,
            module = %envelope.module,
            "Routing capability request"
        );
        self.registry
            .request(
                &envelope.provider,
                &self.ctx,
                call_id,
                app_id,
                &envelope.provider_payload(),
            )
            .await
    }

    /// Route one provider callback. Returns the number of deliveries queued.
    ///
    /// With both ids present only that subscriber is considered; otherwise
    /// every subscriber allowed (provider, module) receives a copy. Anything
    /// else is dropped without telling the provider why.
    pub async fn on_provider_callback(&self, msg: ProviderMessage) -> usize {
        let Some(module) = payload_module(&msg.payload) else {
            debug!(provider = %msg.provider, "Dropped callback without module");
            return 0;
        };
        let stamped = match stamp_provider(&msg.payload, &msg.provider) {
            Ok(stamped) => stamped,
            Err(e) => {
                debug!(provider = %msg.provider, error = %e, "Dropped malformed callback");
                return 0;
            }
        };

        let subscriptions = self.subscriptions.read().await;
        let delivered = match (msg.call_id.as_deref(), msg.app_id.as_deref()) {
            (Some(call_id), Some(app_id)) => subscriptions
                .get(&SubscriptionKey::new(call_id, app_id))
                .filter(|sub| sub.allow.allows(&msg.provider, &module))
                .map_or(0, |sub| usize::from(sub.outbox.send(stamped).is_ok())),
            _ => {
                let mut queued = 0;
                for sub in subscriptions.values() {
                    if sub.allow.allows(&msg.provider, &module)
                        && sub.outbox.send(stamped.clone()).is_ok()
                    {
                        queued += 1;
                    }
                }
                queued
            }
        };
        drop(subscriptions);

        debug!(provider = %msg.provider, module = %module, delivered, "Provider callback routed");
        delivered
    }

    /// Drain provider callbacks into the table until every sender is gone.
    pub fn spawn_callback_pump(
        &self,
        mut callbacks: mpsc::UnboundedReceiver<ProviderMessage>,
    ) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = callbacks.recv().await {
                table.on_provider_callback(msg).await;
            }
            debug!("Provider callback pump stopped");
        })
    }

    /// Drop every subscription without touching providers.
    pub async fn clear(&self) {
        self.subscriptions.write().await.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::provider::{CapabilityProvider, ProviderCallback, ProviderError};
    use crate::routing::ReplyError;

    #[derive(Default)]
    struct RecordingProvider {
        modules: Vec<String>,
        requests: Mutex<Vec<String>>,
        releases: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CapabilityProvider for RecordingProvider {
        async fn init(
            &self,
            _ctx: &HostContext,
            _callback: ProviderCallback,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        fn list_modules(&self) -> Vec<String> {
            self.modules.clone()
        }

        async fn request(
            &self,
            _ctx: &HostContext,
            _call_id: &str,
            _app_id: &str,
            payload: &str,
        ) -> Result<i32, ProviderError> {
            self.requests.lock().unwrap().push(payload.to_string());
            Ok(0)
        }

        async fn release_app(
            &self,
            _ctx: &HostContext,
            call_id: &str,
            app_id: &str,
        ) -> Result<(), ProviderError> {
            self.releases
                .lock()
                .unwrap()
                .push((call_id.to_string(), app_id.to_string()));
            Ok(())
        }

        async fn release_all(&self, _ctx: &HostContext) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct FailingChannel;

    #[async_trait]
    impl ReplyChannel for FailingChannel {
        async fn deliver(&self, _payload: String) -> Result<(), ReplyError> {
            Err(ReplyError::Failed("script host gone".into()))
        }
    }

    async fn table_with_ct() -> (RoutingTable, Arc<RecordingProvider>) {
        let registry = ProviderRegistry::new();
        let ct = Arc::new(RecordingProvider {
            modules: vec!["battery".into(), "wifi".into()],
            ..RecordingProvider::default()
        });
        registry.register_provider("CT", ct.clone()).await;
        (
            RoutingTable::new(registry, HostContext::new("/tmp", "test-host")),
            ct,
        )
    }

    fn callback(call_id: Option<&str>, app_id: Option<&str>, payload: Value) -> ProviderMessage {
        ProviderMessage {
            provider: "CT".into(),
            call_id: call_id.map(str::to_string),
            app_id: app_id.map(str::to_string),
            payload: payload.to_string(),
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn route_rejects_module_outside_allow_list() {
        let (table, ct) = table_with_ct().await;
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx))
            .await;

        let code = table
            .route("c1", "x", r#"{"provider":"CT","module":"wifi"}"#)
            .await;
        assert_eq!(code, -1);
        assert!(ct.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn route_forwards_without_provider_field() {
        let (table, ct) = table_with_ct().await;
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx))
            .await;

        let code = table
            .route("c1", "x", r#"{"provider":"CT","module":"battery","op":"level"}"#)
            .await;
        assert_eq!(code, 0);

        let forwarded: Value =
            serde_json::from_str(&ct.requests.lock().unwrap()[0]).unwrap();
        assert_eq!(forwarded, json!({"module": "battery", "op": "level"}));
    }

    #[tokio::test]
    async fn route_for_unknown_subscriber_fails_closed() {
        let (table, ct) = table_with_ct().await;
        let code = table
            .route("c1", "ghost", r#"{"provider":"CT","module":"battery"}"#)
            .await;
        assert_eq!(code, -1);
        assert!(ct.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn targeted_callback_reaches_only_its_key() {
        let (table, _ct) = table_with_ct().await;
        let allow = AllowList::new().with("CT", "battery");
        let (tx_x, mut rx_x) = mpsc::unbounded_channel::<String>();
        let (tx_y, mut rx_y) = mpsc::unbounded_channel::<String>();
        table.subscribe("c1", "x", allow.clone(), Arc::new(tx_x)).await;
        table.subscribe("c1", "y", allow, Arc::new(tx_y)).await;

        let delivered = table
            .on_provider_callback(callback(Some("c1"), Some("x"), json!({"module": "battery"})))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(recv(&mut rx_x).await["provider"], "CT");
        assert!(rx_y.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_subscribers_without_module() {
        let (table, _ct) = table_with_ct().await;
        let (tx_x, mut rx_x) = mpsc::unbounded_channel::<String>();
        let (tx_y, mut rx_y) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx_x))
            .await;
        table
            .subscribe("c1", "y", AllowList::new().with("CT", "wifi"), Arc::new(tx_y))
            .await;

        let delivered = table
            .on_provider_callback(callback(None, None, json!({"module": "battery", "value": 42})))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(
            recv(&mut rx_x).await,
            json!({"provider": "CT", "module": "battery", "value": 42})
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_y.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_channel_does_not_suppress_others() {
        let (table, _ct) = table_with_ct().await;
        let allow = AllowList::new().with("CT", "battery");
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        table.subscribe("c1", "bad", allow.clone(), Arc::new(FailingChannel)).await;
        table.subscribe("c2", "good", allow, Arc::new(tx)).await;

        let delivered = table
            .on_provider_callback(callback(None, Some("good"), json!({"module": "battery"})))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(recv(&mut rx).await["module"], "battery");
    }

    #[tokio::test]
    async fn callbacks_keep_order_per_subscriber() {
        let (table, _ct) = table_with_ct().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx))
            .await;

        for seq in 0..20 {
            table
                .on_provider_callback(callback(
                    Some("c1"),
                    Some("x"),
                    json!({"module": "battery", "seq": seq}),
                ))
                .await;
        }
        for seq in 0..20 {
            assert_eq!(recv(&mut rx).await["seq"], seq);
        }
    }

    #[tokio::test]
    async fn resubscribe_replaces_channel_and_allow_list() {
        let (table, _ct) = table_with_ct().await;
        let (old_tx, mut old_rx) = mpsc::unbounded_channel::<String>();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(old_tx))
            .await;
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "wifi"), Arc::new(new_tx))
            .await;
        assert_eq!(table.subscription_count().await, 1);

        let battery = table
            .on_provider_callback(callback(Some("c1"), Some("x"), json!({"module": "battery"})))
            .await;
        assert_eq!(battery, 0);

        table
            .on_provider_callback(callback(Some("c1"), Some("x"), json!({"module": "wifi"})))
            .await;
        assert_eq!(recv(&mut new_rx).await["module"], "wifi");
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_releases_on_all_providers_and_drops_late_callbacks() {
        let (table, ct) = table_with_ct().await;
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx))
            .await;

        assert!(table.unsubscribe("c1", "x").await);
        assert_eq!(
            ct.releases.lock().unwrap().as_slice(),
            &[("c1".to_string(), "x".to_string())]
        );

        let late = table
            .on_provider_callback(callback(Some("c1"), Some("x"), json!({"module": "battery"})))
            .await;
        assert_eq!(late, 0);
    }

    #[tokio::test]
    async fn unsubscribe_call_removes_only_that_call() {
        let (table, _ct) = table_with_ct().await;
        for (call, app) in [("c1", "a"), ("c1", "b"), ("c2", "a")] {
            let (tx, _rx) = mpsc::unbounded_channel::<String>();
            table.subscribe(call, app, AllowList::new(), Arc::new(tx)).await;
        }

        assert_eq!(table.unsubscribe_call("c1").await, 2);
        assert!(table.is_subscribed("c2", "a").await);
        assert_eq!(table.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn pump_routes_provider_messages() {
        let (table, _ct) = table_with_ct().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        table
            .subscribe("c1", "x", AllowList::new().with("CT", "battery"), Arc::new(tx))
            .await;

        let (cb_tx, cb_rx) = mpsc::unbounded_channel();
        let pump = table.spawn_callback_pump(cb_rx);
        let provider_side = ProviderCallback::new("CT", cb_tx);
        assert!(provider_side.on_callback(None, None, r#"{"module":"battery","provider":"CM"}"#));

        assert_eq!(recv(&mut rx).await["provider"], "CT");
        drop(provider_side);
        pump.await.unwrap();
    }
}
