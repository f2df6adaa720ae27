//! Inbound event dispatch.
//!
//! Picks the handler for a request's topic (`event`) from a fixed table.
//! Unknown topics go to a handler that logs and drops them. The dispatcher
//! holds no business state of its own.

mod app_control;
mod call_control;
mod capability;
mod screen_share;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use callcap_core::envelope::topic;
use callcap_core::{AppRequest, AppResponse};
use tracing::{debug, warn};

use crate::routing::ReplyChannel;

pub use app_control::AppControlHandler;
pub use call_control::CallControlHandler;
pub use capability::{CapabilityHandler, EcCallbackChannel};
pub use screen_share::{ScreenShareArbiter, ScreenShareHandler};

/// Handles every action of one topic.
///
/// Returns `None` when the action produces no reply.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse>;
}

struct UnknownTopic;

#[async_trait]
impl EventHandler for UnknownTopic {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        warn!(
            call_id,
            app_id,
            topic = %request.event,
            action = %request.action,
            "Unknown topic, dropping"
        );
        None
    }
}

/// The topic handlers a dispatcher routes to.
pub struct TopicHandlers {
    pub call_control: Arc<dyn EventHandler>,
    pub app_control: Arc<dyn EventHandler>,
    pub screen_share: Arc<dyn EventHandler>,
    pub capability: Arc<dyn EventHandler>,
}

pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
    fallback: Arc<dyn EventHandler>,
}

impl Dispatcher {
    pub fn new(handlers: TopicHandlers) -> Self {
        let handlers = HashMap::from([
            (topic::CALL_APP_EVENT, handlers.call_control),
            (topic::COMMON_APP_EVENT, handlers.app_control),
            (topic::SCREEN_APP_EVENT, handlers.screen_share),
            (topic::EC_EVENT, handlers.capability),
        ]);
        Self {
            handlers,
            fallback: Arc::new(UnknownTopic),
        }
    }

    fn handler_for(&self, topic: &str) -> &Arc<dyn EventHandler> {
        self.handlers.get(topic).unwrap_or(&self.fallback)
    }

    /// Run a request through its topic handler and return the reply.
    pub async fn handle_request(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        debug!(call_id, app_id, topic = %request.event, action = %request.action, "Dispatching");
        self.handler_for(&request.event)
            .handle(call_id, app_id, request)
            .await
    }

    /// Dispatch and deliver the reply, if any, to `reply`.
    ///
    /// Returns whether a reply was produced.
    pub async fn dispatch(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
        reply: Option<Arc<dyn ReplyChannel>>,
    ) -> bool {
        let Some(response) = self.handle_request(call_id, app_id, request).await else {
            return false;
        };
        if let Some(channel) = reply {
            match serde_json::to_string(&response) {
                Ok(text) => {
                    if let Err(e) = channel.deliver(text).await {
                        warn!(call_id, app_id, error = %e, "Reply delivery failed");
                    }
                }
                Err(e) => warn!(call_id, app_id, error = %e, "Unencodable reply"),
            }
        }
        true
    }
}
