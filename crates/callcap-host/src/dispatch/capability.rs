//! `ECEvent` topic: capability discovery, subscription and requests.

use std::sync::Arc;

use async_trait::async_trait;
use callcap_core::envelope::{action, notify};
use callcap_core::{AppRequest, AppResponse, NotifyEvent};
use serde_json::Value;
use tracing::{debug, info};

use super::EventHandler;
use crate::call::CallStateProvider;
use crate::link::MiniAppLinks;
use crate::permission::PermissionGate;
use crate::routing::{AllowList, ReplyChannel, ReplyError, RoutingTable};

const PROVIDER_MODULES_PARAM: &str = "providerModules";
const PERMISSIONS_PARAM: &str = "permissions";

/// Reply channel of a capability subscription: wraps each stamped provider
/// payload into an `ecCallback` notify event for the mini-app.
pub struct EcCallbackChannel {
    links: MiniAppLinks,
    call_id: String,
    app_id: String,
}

impl EcCallbackChannel {
    pub fn new(links: MiniAppLinks, call_id: &str, app_id: &str) -> Self {
        Self {
            links,
            call_id: call_id.to_string(),
            app_id: app_id.to_string(),
        }
    }
}

#[async_trait]
impl ReplyChannel for EcCallbackChannel {
    async fn deliver(&self, payload: String) -> Result<(), ReplyError> {
        let event = NotifyEvent::new(notify::EC_CALLBACK).with_param("msg", payload);
        if self.links.notify_event(&self.call_id, &self.app_id, &event).await {
            Ok(())
        } else {
            Err(ReplyError::Closed)
        }
    }
}

pub struct CapabilityHandler {
    routing: RoutingTable,
    gate: PermissionGate,
    links: MiniAppLinks,
    calls: Arc<dyn CallStateProvider>,
}

impl CapabilityHandler {
    pub fn new(
        routing: RoutingTable,
        gate: PermissionGate,
        links: MiniAppLinks,
        calls: Arc<dyn CallStateProvider>,
    ) -> Self {
        Self {
            routing,
            gate,
            links,
            calls,
        }
    }

    async fn query(&self) -> AppResponse {
        let modules = self.routing.registry().modules_map().await;
        match serde_json::to_value(modules) {
            Ok(data) => AppResponse::success(data),
            Err(_) => AppResponse::failure(),
        }
    }

    async fn register(&self, call_id: &str, app_id: &str, request: &AppRequest) -> AppResponse {
        if !request.params.contains_key(PROVIDER_MODULES_PARAM) {
            return AppResponse::failure();
        }
        let entries = request.param_str_list(PROVIDER_MODULES_PARAM);
        let allow = AllowList::from_provider_modules(&entries);
        let channel = Arc::new(EcCallbackChannel::new(self.links.clone(), call_id, app_id));
        self.routing.subscribe(call_id, app_id, allow, channel).await;
        AppResponse::success(Value::Null)
    }

    async fn request(&self, call_id: &str, app_id: &str, mut request: AppRequest) -> AppResponse {
        let phase = self.calls.call_phase(call_id);
        if !phase.is_some_and(|p| p.allows_capabilities()) {
            debug!(call_id, app_id, ?phase, "Capability request outside active call");
            return AppResponse::failure();
        }

        let permissions = request.param_str_list(PERMISSIONS_PARAM);
        request.params.remove(PERMISSIONS_PARAM);
        if !permissions.is_empty()
            && !self.gate.check_and_record(app_id, &permissions, true).await
        {
            return AppResponse::failure();
        }

        let envelope = Value::Object(request.params).to_string();
        AppResponse::from_status(self.routing.route(call_id, app_id, &envelope).await)
    }
}

#[async_trait]
impl EventHandler for CapabilityHandler {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        match request.action.as_str() {
            action::QUERY_EC => Some(self.query().await),
            action::REGISTER_EC => {
                info!(call_id, app_id, "Mini-app registering for capabilities");
                Some(self.register(call_id, app_id, &request).await)
            }
            action::REQUEST_EC => Some(self.request(call_id, app_id, request).await),
            other => {
                debug!(call_id, app_id, action = other, "Unhandled capability action");
                None
            }
        }
    }
}
