//! `screenAppEvent` topic: one screen sharer per call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use callcap_core::envelope::action;
use callcap_core::{AppRequest, AppResponse};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::EventHandler;

/// Tracks which app, if any, is sharing its screen in each call.
#[derive(Clone, Default)]
pub struct ScreenShareArbiter {
    sharers: Arc<RwLock<HashMap<String, String>>>,
}

impl ScreenShareArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the call's share slot. Succeeds when free or already held by `app_id`.
    pub async fn try_start(&self, call_id: &str, app_id: &str) -> bool {
        let mut sharers = self.sharers.write().await;
        match sharers.get(call_id) {
            Some(owner) => owner == app_id,
            None => {
                sharers.insert(call_id.to_string(), app_id.to_string());
                drop(sharers);
                info!(call_id, app_id, "Screen share started");
                true
            }
        }
    }

    /// Release the slot if `app_id` holds it.
    pub async fn stop(&self, call_id: &str, app_id: &str) -> bool {
        let mut sharers = self.sharers.write().await;
        if sharers.get(call_id).is_some_and(|owner| owner == app_id) {
            sharers.remove(call_id);
            drop(sharers);
            info!(call_id, app_id, "Screen share stopped");
            true
        } else {
            false
        }
    }

    pub async fn is_available(&self, call_id: &str, app_id: &str) -> bool {
        self.sharers
            .read()
            .await
            .get(call_id)
            .is_none_or(|owner| owner == app_id)
    }

    pub async fn sharer(&self, call_id: &str) -> Option<String> {
        self.sharers.read().await.get(call_id).cloned()
    }

    pub async fn release_call(&self, call_id: &str) {
        self.sharers.write().await.remove(call_id);
    }
}

pub struct ScreenShareHandler {
    arbiter: ScreenShareArbiter,
}

impl ScreenShareHandler {
    pub const fn new(arbiter: ScreenShareArbiter) -> Self {
        Self { arbiter }
    }
}

fn status(ok: bool) -> AppResponse {
    if ok {
        AppResponse::success(Value::Null)
    } else {
        AppResponse::failure()
    }
}

#[async_trait]
impl EventHandler for ScreenShareHandler {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        match request.action.as_str() {
            action::START_SCREEN_SHARE => {
                Some(status(self.arbiter.try_start(call_id, app_id).await))
            }
            action::STOP_SCREEN_SHARE => Some(status(self.arbiter.stop(call_id, app_id).await)),
            action::REQUEST_SCREEN_SHARE_ABILITY => {
                let available = self.arbiter.is_available(call_id, app_id).await;
                Some(AppResponse::success(json!({ "available": available })))
            }
            other => {
                debug!(call_id, app_id, action = other, "Unhandled screen share action");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_app_cannot_take_the_slot() {
        let arbiter = ScreenShareArbiter::new();
        assert!(arbiter.try_start("c1", "a").await);
        assert!(arbiter.try_start("c1", "a").await);
        assert!(!arbiter.try_start("c1", "b").await);
        assert!(arbiter.try_start("c2", "b").await);

        assert!(!arbiter.is_available("c1", "b").await);
        assert!(!arbiter.stop("c1", "b").await);
        assert!(arbiter.stop("c1", "a").await);
        assert!(arbiter.is_available("c1", "b").await);
    }

    #[tokio::test]
    async fn handler_replies_with_codes() {
        let handler = ScreenShareHandler::new(ScreenShareArbiter::new());
        let start = |app: &'static str| {
            let request = AppRequest::new("screenAppEvent", action::START_SCREEN_SHARE);
            handler.handle("c1", app, request)
        };
        assert_eq!(start("a").await.map(|r| r.code), Some(0));
        assert_eq!(start("b").await.map(|r| r.code), Some(-1));

        let ability = handler
            .handle(
                "c1",
                "b",
                AppRequest::new("screenAppEvent", action::REQUEST_SCREEN_SHARE_ABILITY),
            )
            .await
            .map(|r| r.data);
        assert_eq!(ability, Some(json!({ "available": false })));
    }
}
