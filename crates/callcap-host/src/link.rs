//! Links between the host and running mini-apps.
//!
//! [`MiniAppLinks`] is the host-to-mini direction: one reply channel per
//! attached (call, app). [`HostUplink`] is the mini-to-host direction used
//! when a change made inside a mini-app must be picked up by the host.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use callcap_core::{AppRequest, NotifyEvent};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::routing::{ReplyChannel, ReplyError, SubscriptionKey};

/// Reply channels of attached mini-apps.
#[derive(Clone, Default)]
pub struct MiniAppLinks {
    links: Arc<RwLock<HashMap<SubscriptionKey, Arc<dyn ReplyChannel>>>>,
}

impl MiniAppLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a channel. Replaces any channel already attached for the pair.
    pub async fn attach(&self, call_id: &str, app_id: &str, channel: Arc<dyn ReplyChannel>) {
        self.links
            .write()
            .await
            .insert(SubscriptionKey::new(call_id, app_id), channel);
        debug!(call_id, app_id, "Mini-app link attached");
    }

    pub async fn detach(&self, call_id: &str, app_id: &str) -> bool {
        let removed = self
            .links
            .write()
            .await
            .remove(&SubscriptionKey::new(call_id, app_id))
            .is_some();
        if removed {
            debug!(call_id, app_id, "Mini-app link detached");
        }
        removed
    }

    /// Detach every app of a call. Returns how many links were removed.
    pub async fn detach_call(&self, call_id: &str) -> usize {
        let mut links = self.links.write().await;
        let before = links.len();
        links.retain(|key, _| key.call_id != call_id);
        before - links.len()
    }

    /// Apps attached in `call_id`, sorted.
    pub async fn apps_for_call(&self, call_id: &str) -> Vec<String> {
        let mut apps: Vec<String> = self
            .links
            .read()
            .await
            .keys()
            .filter(|key| key.call_id == call_id)
            .map(|key| key.app_id.clone())
            .collect();
        apps.sort();
        apps
    }

    pub async fn channel(&self, call_id: &str, app_id: &str) -> Option<Arc<dyn ReplyChannel>> {
        self.links
            .read()
            .await
            .get(&SubscriptionKey::new(call_id, app_id))
            .cloned()
    }

    pub async fn is_attached(&self, call_id: &str, app_id: &str) -> bool {
        self.channel(call_id, app_id).await.is_some()
    }

    /// Push raw text to a mini-app. Unattached pairs are a silent drop.
    pub async fn send(&self, call_id: &str, app_id: &str, text: String) -> bool {
        let Some(channel) = self.channel(call_id, app_id).await else {
            debug!(call_id, app_id, "No link for mini-app, dropping");
            return false;
        };
        match channel.deliver(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(call_id, app_id, error = %e, "Mini-app link delivery failed");
                false
            }
        }
    }

    pub async fn notify_event(&self, call_id: &str, app_id: &str, event: &NotifyEvent) -> bool {
        match event.to_json() {
            Ok(text) => self.send(call_id, app_id, text).await,
            Err(e) => {
                warn!(call_id, app_id, action = %event.action, error = %e, "Unencodable notify event");
                false
            }
        }
    }

    /// Push `event` to every app attached in `call_id`. Returns the delivered count.
    pub async fn notify_call(&self, call_id: &str, event: &NotifyEvent) -> usize {
        let mut delivered = 0;
        for app_id in self.apps_for_call(call_id).await {
            if self.notify_event(call_id, &app_id, event).await {
                delivered += 1;
            }
        }
        delivered
    }
}

/// A request travelling from a mini-app's side up to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRequest {
    pub call_id: String,
    pub app_id: String,
    pub request: AppRequest,
}

/// Mini-to-host direction.
#[async_trait]
pub trait HostUplink: Send + Sync {
    async fn forward(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Result<(), ReplyError>;
}

/// In-process uplink: queues requests for the host to dispatch.
#[derive(Debug, Clone)]
pub struct ChannelUplink {
    tx: mpsc::UnboundedSender<UplinkRequest>,
}

impl ChannelUplink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UplinkRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HostUplink for ChannelUplink {
    async fn forward(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Result<(), ReplyError> {
        self.tx
            .send(UplinkRequest {
                call_id: call_id.to_string(),
                app_id: app_id.to_string(),
                request,
            })
            .map_err(|_| ReplyError::Closed)
    }
}
