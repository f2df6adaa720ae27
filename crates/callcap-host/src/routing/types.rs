//! Routing table types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One running mini-app inside one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub call_id: String,
    pub app_id: String,
}

impl SubscriptionKey {
    pub fn new(call_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            app_id: app_id.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.call_id, self.app_id)
    }
}

/// Provider id -> modules a subscriber may use. Anything absent is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, provider: &str, module: &str) {
        self.entries
            .entry(provider.to_string())
            .or_default()
            .insert(module.to_string());
    }

    #[must_use]
    pub fn with(mut self, provider: &str, module: &str) -> Self {
        self.allow(provider, module);
        self
    }

    /// Build from `"provider-module"` entries.
    ///
    /// The provider is the text before the first dash and the module the
    /// text between the first and second dash; anything after a second dash
    /// is dropped, so `"OEM-screen-share"` allows module `screen`. Entries
    /// without a dash, or with an empty provider or module, are skipped.
    pub fn from_provider_modules<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut list = Self::new();
        for entry in entries {
            let mut parts = entry.as_ref().split('-');
            if let (Some(provider), Some(module)) = (parts.next(), parts.next())
                && !provider.is_empty()
                && !module.is_empty()
            {
                list.allow(provider, module);
            }
        }
        list
    }

    pub fn allows(&self, provider: &str, module: &str) -> bool {
        self.entries
            .get(provider)
            .is_some_and(|modules| modules.contains(module))
    }

}

/// A reply channel refused or failed to take a payload.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply channel closed")]
    Closed,

    #[error("reply delivery failed: {0}")]
    Failed(String),
}

/// Per-subscriber sink for stamped provider payloads.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn deliver(&self, payload: String) -> Result<(), ReplyError>;
}

#[async_trait]
impl ReplyChannel for mpsc::UnboundedSender<String> {
    async fn deliver(&self, payload: String) -> Result<(), ReplyError> {
        self.send(payload).map_err(|_| ReplyError::Closed)
    }
}
