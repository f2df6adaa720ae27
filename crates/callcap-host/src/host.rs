//! The host service object.
//!
//! Built once at process start and handed to whatever drives it (the stdio
//! bridge in the binary, tests, an embedding process). Owns the provider
//! registry, routing table, permission gate and dispatcher, and runs their
//! background tasks between [`Host::init`] and [`Host::release`].

use std::sync::Arc;

use callcap_core::AppRequest;
use callcap_core::config::PermissionConfig;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::call::{CallControl, CallPhase, CallRegistry, PhaseTracker, RegistryCallControl};
use crate::dispatch::{
    AppControlHandler, CallControlHandler, CapabilityHandler, Dispatcher, ScreenShareArbiter,
    ScreenShareHandler, TopicHandlers,
};
use crate::link::{ChannelUplink, MiniAppLinks, UplinkRequest};
use crate::permission::{PermissionGate, StaticSystemPermissions, SystemPermissionChecker};
use crate::provider::{CapabilityProvider, HostContext, ProviderRegistry};
use crate::routing::{ReplyChannel, RoutingTable};
use crate::storage::PermissionStore;

/// Construction inputs for [`Host`].
pub struct HostOptions {
    pub ctx: HostContext,
    pub permissions: PermissionConfig,
    pub store: Arc<dyn PermissionStore>,
    /// Defaults to [`RegistryCallControl`] over the host's phase tracker.
    pub call_control: Option<Arc<dyn CallControl>>,
    /// Defaults to the `system_granted` list of `permissions`.
    pub system_permissions: Option<Arc<dyn SystemPermissionChecker>>,
}

impl HostOptions {
    pub fn new(ctx: HostContext, store: Arc<dyn PermissionStore>) -> Self {
        Self {
            ctx,
            permissions: PermissionConfig::default(),
            store,
            call_control: None,
            system_permissions: None,
        }
    }
}

pub struct Host {
    ctx: HostContext,
    registry: ProviderRegistry,
    routing: RoutingTable,
    gate: PermissionGate,
    links: MiniAppLinks,
    calls: CallRegistry,
    phases: PhaseTracker,
    screen_share: ScreenShareArbiter,
    dispatcher: Arc<Dispatcher>,
    app_control: Arc<AppControlHandler>,
    uplink_rx: Mutex<Option<mpsc::UnboundedReceiver<UplinkRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    pub fn new(options: HostOptions) -> Self {
        let HostOptions {
            ctx,
            permissions,
            store,
            call_control,
            system_permissions,
        } = options;

        let registry = ProviderRegistry::new();
        let routing = RoutingTable::new(registry.clone(), ctx.clone());
        let links = MiniAppLinks::new();
        let calls = CallRegistry::new();
        let phases = PhaseTracker::new(calls.clone(), links.clone());
        let screen_share = ScreenShareArbiter::new();

        let (uplink, uplink_rx) = ChannelUplink::new();
        let system = system_permissions.unwrap_or_else(|| {
            Arc::new(StaticSystemPermissions::new(
                permissions.system_granted.iter().cloned(),
            ))
        });
        let gate =
            PermissionGate::new(store, links.clone(), Arc::new(uplink), system, permissions);

        let control: Arc<dyn CallControl> = call_control
            .unwrap_or_else(|| Arc::new(RegistryCallControl::new(phases.clone())));
        let app_control = Arc::new(AppControlHandler::new(
            gate.clone(),
            routing.clone(),
            screen_share.clone(),
            links.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(TopicHandlers {
            call_control: Arc::new(CallControlHandler::new(
                gate.clone(),
                Arc::new(calls.clone()),
                control,
            )),
            app_control: app_control.clone(),
            screen_share: Arc::new(ScreenShareHandler::new(screen_share.clone())),
            capability: Arc::new(CapabilityHandler::new(
                routing.clone(),
                gate.clone(),
                links.clone(),
                Arc::new(calls.clone()),
            )),
        }));

        Self {
            ctx,
            registry,
            routing,
            gate,
            links,
            calls,
            phases,
            screen_share,
            dispatcher,
            app_control,
            uplink_rx: Mutex::new(Some(uplink_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub const fn context(&self) -> &HostContext {
        &self.ctx
    }

    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub const fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub const fn permissions(&self) -> &PermissionGate {
        &self.gate
    }

    pub const fn links(&self) -> &MiniAppLinks {
        &self.links
    }

    pub const fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    pub const fn screen_share(&self) -> &ScreenShareArbiter {
        &self.screen_share
    }

    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn register_provider(&self, id: &str, provider: Arc<dyn CapabilityProvider>) {
        self.registry.register_provider(id, provider).await;
    }

    /// Start background tasks and initialise every registered provider.
    ///
    /// Returns the number of providers that initialised.
    pub async fn init(&self) -> usize {
        let (callbacks_tx, callbacks_rx) = mpsc::unbounded_channel();
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.routing.spawn_callback_pump(callbacks_rx));
        tasks.push(self.gate.spawn_store_follower());

        if let Some(mut uplink_rx) = self.uplink_rx.lock().await.take() {
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.push(tokio::spawn(async move {
                while let Some(up) = uplink_rx.recv().await {
                    debug!(
                        call_id = %up.call_id,
                        app_id = %up.app_id,
                        action = %up.request.action,
                        "Uplinked request"
                    );
                    dispatcher
                        .handle_request(&up.call_id, &up.app_id, up.request)
                        .await;
                }
            }));
        }
        drop(tasks);

        let ready = self.registry.init_all(&self.ctx, &callbacks_tx).await;
        info!(
            host = %self.ctx.host_name,
            providers = self.registry.provider_count().await,
            ready,
            "Host initialised"
        );
        ready
    }

    /// Connect a mini-app's reply channel for host-to-mini notifications.
    pub async fn attach_app(&self, call_id: &str, app_id: &str, channel: Arc<dyn ReplyChannel>) {
        self.links.attach(call_id, app_id, channel).await;
    }

    /// Dispatch one inbound request; the reply, if any, goes to `reply`.
    pub async fn dispatch(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
        reply: Option<Arc<dyn ReplyChannel>>,
    ) -> bool {
        self.dispatcher.dispatch(call_id, app_id, request, reply).await
    }

    /// Record a call's phase. A change pushes `callStateNotify` to the
    /// call's attached apps; returns how many were notified.
    pub async fn set_call_phase(&self, call_id: &str, phase: CallPhase) -> usize {
        self.phases.set_phase(call_id, phase).await
    }

    /// A mini-app stopped: drop its subscription, share slot and link.
    pub async fn app_stopped(&self, call_id: &str, app_id: &str) {
        self.app_control.stop_app(call_id, app_id).await;
    }

    /// A call ended: tear down every mini-app hosted in it.
    pub async fn call_ended(&self, call_id: &str) {
        let unsubscribed = self.routing.unsubscribe_call(call_id).await;
        self.screen_share.release_call(call_id).await;
        let detached = self.links.detach_call(call_id).await;
        self.calls.remove(call_id);
        info!(call_id, unsubscribed, detached, "Call ended");
    }

    /// Release every provider and stop background tasks.
    pub async fn release(&self) {
        self.registry.release_all(&self.ctx).await;
        self.routing.clear().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(host = %self.ctx.host_name, "Host released");
    }
}
