//! `commonAppEvent` topic: permission refresh and app shutdown.

use async_trait::async_trait;
use callcap_core::envelope::action;
use callcap_core::{AppRequest, AppResponse};
use serde_json::Value;
use tracing::{debug, info};

use super::EventHandler;
use super::screen_share::ScreenShareArbiter;
use crate::link::MiniAppLinks;
use crate::permission::PermissionGate;
use crate::routing::RoutingTable;

pub struct AppControlHandler {
    gate: PermissionGate,
    routing: RoutingTable,
    screen_share: ScreenShareArbiter,
    links: MiniAppLinks,
}

impl AppControlHandler {
    pub const fn new(
        gate: PermissionGate,
        routing: RoutingTable,
        screen_share: ScreenShareArbiter,
        links: MiniAppLinks,
    ) -> Self {
        Self {
            gate,
            routing,
            screen_share,
            links,
        }
    }

    /// Tear down everything held for one mini-app instance.
    pub async fn stop_app(&self, call_id: &str, app_id: &str) {
        self.routing.unsubscribe(call_id, app_id).await;
        self.screen_share.stop(call_id, app_id).await;
        self.links.detach(call_id, app_id).await;
        info!(call_id, app_id, "Mini-app stopped");
    }
}

#[async_trait]
impl EventHandler for AppControlHandler {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        match request.action.as_str() {
            action::REFRESH_PERMISSION => {
                // An uplinked refresh may name a different app than the sender.
                let target = request.param_str("appId").unwrap_or(app_id);
                self.gate.refresh_from_store(target).await;
                Some(AppResponse::success(Value::Null))
            }
            action::STOP_APP => {
                self.stop_app(call_id, app_id).await;
                Some(AppResponse::success(Value::Null))
            }
            other => {
                debug!(call_id, app_id, action = other, "Unhandled app action");
                None
            }
        }
    }
}
