//! Provider declarations read from `providers.toml`.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::socket::SocketProvider;
use super::types::{CapabilityProvider, ProviderError};

const fn default_enabled() -> bool {
    true
}

/// One out-of-process provider reachable over a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderDeclaration {
    pub id: String,
    pub socket: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: Vec<ProviderDeclaration>,
}

impl ProvidersConfig {
    /// Load declarations. A missing or blank file yields no providers; any
    /// other read failure is returned.
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&content)
            .map_err(|e| ProviderError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Provider ids are the first segment of allow-list entries, so they
    /// must be non-empty, dash-free and unique.
    fn validate(&self) -> Result<(), ProviderError> {
        let mut seen = HashSet::new();
        for decl in &self.providers {
            if decl.id.is_empty() || decl.id.contains('-') {
                return Err(ProviderError::Config(format!(
                    "provider id {:?} must be non-empty and contain no '-'",
                    decl.id
                )));
            }
            if !seen.insert(decl.id.as_str()) {
                return Err(ProviderError::Config(format!(
                    "provider {} declared twice",
                    decl.id
                )));
            }
        }
        Ok(())
    }

    /// Socket providers for every enabled declaration.
    pub fn build_providers(&self) -> Vec<(String, Arc<dyn CapabilityProvider>)> {
        self.providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| {
                let provider: Arc<dyn CapabilityProvider> = Arc::new(SocketProvider::new(
                    p.id.clone(),
                    p.socket.clone(),
                    p.modules.clone(),
                ));
                (p.id.clone(), provider)
            })
            .collect()
    }
}
