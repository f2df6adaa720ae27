//! Capability providers and the registry that owns them.
//!
//! A provider advertises named modules and answers requests asynchronously
//! through a [`ProviderCallback`] bound to its id at init time.

mod config;
mod registry;
mod socket;
mod types;

pub use config::{ProviderDeclaration, ProvidersConfig};
pub use registry::ProviderRegistry;
pub use socket::SocketProvider;
pub use types::{
    CapabilityProvider, HostContext, ProviderCallback, ProviderError, ProviderMessage,
    STATUS_FAILED,
};
