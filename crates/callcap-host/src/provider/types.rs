//! Provider contract types.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Status code returned for unknown providers, malformed payloads and faults.
pub const STATUS_FAILED: i32 = -1;

/// Host facilities handed to providers on every lifecycle call.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub data_dir: PathBuf,
    pub host_name: String,
}

impl HostContext {
    pub fn new(data_dir: impl Into<PathBuf>, host_name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            host_name: host_name.into(),
        }
    }
}

/// Errors raised by a provider implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider init failed: {0}")]
    Init(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Request(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Provider config error: {0}")]
    Config(String),

    #[error("Provider did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("Provider panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A provider result travelling back to the routing table.
///
/// `provider` is set by the [`ProviderCallback`] that produced it, never by
/// the provider itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub provider: String,
    pub call_id: Option<String>,
    pub app_id: Option<String>,
    pub payload: String,
}

/// Callback handle given to one provider. Every message it sends is tagged
/// with the provider id it was created for.
#[derive(Debug, Clone)]
pub struct ProviderCallback {
    provider: String,
    tx: mpsc::UnboundedSender<ProviderMessage>,
}

impl ProviderCallback {
    pub fn new(provider: impl Into<String>, tx: mpsc::UnboundedSender<ProviderMessage>) -> Self {
        Self {
            provider: provider.into(),
            tx,
        }
    }

    /// Queue a callback. Leaving `call_id` or `app_id` empty broadcasts it.
    ///
    /// Never blocks. Returns `false` once the routing table has shut down.
    pub fn on_callback(
        &self,
        call_id: Option<&str>,
        app_id: Option<&str>,
        payload: impl Into<String>,
    ) -> bool {
        self.tx
            .send(ProviderMessage {
                provider: self.provider.clone(),
                call_id: call_id.map(str::to_string),
                app_id: app_id.map(str::to_string),
                payload: payload.into(),
            })
            .is_ok()
    }
}

/// Contract every capability provider implements.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Bind the provider. `callback` is its only channel back into the host.
    async fn init(
        &self,
        ctx: &HostContext,
        callback: ProviderCallback,
    ) -> Result<(), ProviderError>;

    /// Advertised module names, in declaration order.
    fn list_modules(&self) -> Vec<String>;

    /// Dispatch a request. The returned status code is provider-defined.
    async fn request(
        &self,
        ctx: &HostContext,
        call_id: &str,
        app_id: &str,
        payload: &str,
    ) -> Result<i32, ProviderError>;

    /// Drop any resources held for one mini-app instance.
    async fn release_app(
        &self,
        ctx: &HostContext,
        call_id: &str,
        app_id: &str,
    ) -> Result<(), ProviderError>;

    async fn release_all(&self, ctx: &HostContext) -> Result<(), ProviderError>;
}
