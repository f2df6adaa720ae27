//! Provider registry.
//!
//! Holds every registered provider by id and owns their lifecycle. Every
//! provider call runs on its own task, so a provider that panics or stalls
//! is logged at this boundary and never reaches callers as an error.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::types::{
    CapabilityProvider, HostContext, ProviderCallback, ProviderError, ProviderMessage,
    STATUS_FAILED,
};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

type ProviderEntry = (String, Arc<dyn CapabilityProvider>);

/// Run one provider call on its own task. A panic becomes
/// [`ProviderError::Panicked`].
async fn contained<T, F>(call: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ProviderError>> + Send + 'static,
{
    tokio::spawn(call)
        .await
        .map_err(|e| ProviderError::Panicked(e.to_string()))?
}

/// Run `call` for every provider at once, each bounded by `limit`.
///
/// Returns the ids whose call succeeded. Failures are logged with `op`.
async fn fan_out<F, Fut>(
    providers: Vec<ProviderEntry>,
    limit: Duration,
    op: &'static str,
    call: F,
) -> Vec<String>
where
    F: Fn(&str, Arc<dyn CapabilityProvider>) -> Fut,
    Fut: Future<Output = Result<(), ProviderError>> + Send + 'static,
{
    let mut calls = JoinSet::new();
    for (id, provider) in providers {
        let pending = call(&id, provider);
        calls.spawn(async move {
            let outcome = tokio::time::timeout(limit, contained(pending))
                .await
                .unwrap_or_else(|_| Err(ProviderError::TimedOut(limit)));
            (id, outcome)
        });
    }

    let mut succeeded = Vec::new();
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok((id, Ok(()))) => succeeded.push(id),
            Ok((id, Err(e))) => warn!(provider = %id, op, error = %e, "Provider call failed"),
            Err(e) => warn!(op, error = %e, "Provider call task lost"),
        }
    }
    succeeded
}

/// Registry of capability providers keyed by provider id.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<String, Arc<dyn CapabilityProvider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a provider. An existing provider with the same id is replaced.
    pub async fn register_provider(&self, id: &str, provider: Arc<dyn CapabilityProvider>) {
        let replaced = self
            .providers
            .write()
            .await
            .insert(id.to_string(), provider)
            .is_some();
        info!(provider = %id, replaced, "Capability provider registered");
    }

    async fn snapshot(&self) -> Vec<ProviderEntry> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), Arc::clone(p)))
            .collect()
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.read().await.get(id).cloned()
    }

    /// Initialise every provider with a callback bound to its id.
    ///
    /// Providers initialise concurrently; one that fails, panics or does not
    /// finish in time is left out. Returns the number that initialised.
    pub async fn init_all(
        &self,
        ctx: &HostContext,
        callbacks: &mpsc::UnboundedSender<ProviderMessage>,
    ) -> usize {
        let ready = fan_out(self.snapshot().await, INIT_TIMEOUT, "init", |id, provider| {
            let ctx = ctx.clone();
            let callback = ProviderCallback::new(id, callbacks.clone());
            async move { provider.init(&ctx, callback).await }
        })
        .await;
        for id in &ready {
            info!(provider = %id, "Capability provider initialised");
        }
        ready.len()
    }

    /// Modules advertised by `id`, or empty when the provider is unknown.
    pub async fn list_modules(&self, id: &str) -> Vec<String> {
        match self.get(id).await {
            Some(provider) => provider.list_modules(),
            None => Vec::new(),
        }
    }

    /// Every provider id with its module list.
    pub async fn modules_map(&self) -> BTreeMap<String, Vec<String>> {
        self.snapshot()
            .await
            .into_iter()
            .map(|(id, p)| (id, p.list_modules()))
            .collect()
    }

    /// Forward a request (already stripped of its `provider` field).
    ///
    /// Returns the provider's own status code, or `-1` for an unknown
    /// provider, a payload that is not a JSON object, or a provider fault.
    pub async fn request(
        &self,
        id: &str,
        ctx: &HostContext,
        call_id: &str,
        app_id: &str,
        payload: &str,
    ) -> i32 {
        let Some(provider) = self.get(id).await else {
            debug!(provider = %id, call_id, app_id, "Request for unknown provider");
            return STATUS_FAILED;
        };

        if serde_json::from_str::<Map<String, Value>>(payload).is_err() {
            warn!(provider = %id, call_id, app_id, "Malformed capability payload");
            return STATUS_FAILED;
        }

        let request = {
            let ctx = ctx.clone();
            let (call_id, app_id, payload) =
                (call_id.to_string(), app_id.to_string(), payload.to_string());
            async move { provider.request(&ctx, &call_id, &app_id, &payload).await }
        };
        match contained(request).await {
            Ok(code) => {
                debug!(provider = %id, call_id, app_id, code, "Capability request dispatched");
                code
            }
            Err(e) => {
                warn!(provider = %id, call_id, app_id, error = %e, "Capability request failed");
                STATUS_FAILED
            }
        }
    }

    /// Ask every provider to release resources held for (`call_id`, `app_id`).
    pub async fn release_app(&self, ctx: &HostContext, call_id: &str, app_id: &str) {
        fan_out(self.snapshot().await, RELEASE_TIMEOUT, "release_app", |_, provider| {
            let ctx = ctx.clone();
            let (call_id, app_id) = (call_id.to_string(), app_id.to_string());
            async move { provider.release_app(&ctx, &call_id, &app_id).await }
        })
        .await;
    }

    /// Release every provider and clear the registry.
    pub async fn release_all(&self, ctx: &HostContext) {
        let drained: Vec<_> = self.providers.write().await.drain().collect();
        let released = fan_out(drained, RELEASE_TIMEOUT, "release_all", |_, provider| {
            let ctx = ctx.clone();
            async move { provider.release_all(&ctx).await }
        })
        .await;
        for id in &released {
            info!(provider = %id, "Capability provider released");
        }
    }

    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
