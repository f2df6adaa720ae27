//! Layered configuration.
//!
//! Later layers win: built-in defaults, the global `settings.json` under
//! [`base_dir`], an explicit `--config` file, `CALLCAP_*` variables, then
//! flags applied by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete callcap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

/// Host-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub database_path: Option<PathBuf>,
    pub providers_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            providers_path: None,
            data_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Permission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Upper bound for loading an uncached grant map (milliseconds).
    pub load_timeout_ms: u64,
    /// Rolling window for usage display (days).
    pub usage_window_days: u32,
    /// OS-level permissions this host process holds.
    #[serde(default)]
    pub system_granted: Vec<String>,
}

impl PermissionConfig {
    pub const fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Length of the usage window in milliseconds.
    pub const fn usage_window_millis(&self) -> i64 {
        self.usage_window_days as i64 * 24 * 60 * 60 * 1000
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 3000,
            usage_window_days: 7,
            system_granted: Vec::new(),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|path| path.exists());
    let mut config = load_layers(global.as_deref(), explicit_path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

fn load_layers(global_path: Option<&Path>, explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    for path in [global_path, explicit_path].into_iter().flatten() {
        let layer = load_config_file(path)?;
        merge_config(&mut config, layer);
    }
    Ok(config)
}

/// Base directory for callcap state (`$XDG_CONFIG_HOME/callcap` on Linux).
pub fn base_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("callcap"))
}

/// The global `settings.json`.
pub fn global_config_path() -> Option<PathBuf> {
    base_dir().map(|d| d.join("settings.json"))
}

/// Default Permission Store database.
pub fn database_path() -> Option<PathBuf> {
    base_dir().map(|d| d.join("permissions.db"))
}

/// Default provider declaration file.
pub fn providers_path() -> Option<PathBuf> {
    base_dir().map(|d| d.join("providers.toml"))
}

/// One configuration file. Only keys present in the file override lower layers.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    host: HostLayer,
    permissions: PermissionLayer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostLayer {
    database_path: Option<PathBuf>,
    providers_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PermissionLayer {
    load_timeout_ms: Option<u64>,
    usage_window_days: Option<u32>,
    system_granted: Option<Vec<String>>,
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, layer: ConfigLayer) {
    let ConfigLayer { host, permissions } = layer;

    if host.database_path.is_some() {
        base.host.database_path = host.database_path;
    }
    if host.providers_path.is_some() {
        base.host.providers_path = host.providers_path;
    }
    if host.data_dir.is_some() {
        base.host.data_dir = host.data_dir;
    }
    if let Some(level) = host.log_level {
        base.host.log_level = level;
    }

    if let Some(ms) = permissions.load_timeout_ms {
        base.permissions.load_timeout_ms = ms;
    }
    if let Some(days) = permissions.usage_window_days {
        base.permissions.usage_window_days = days;
    }
    if let Some(granted) = permissions.system_granted {
        base.permissions.system_granted = granted;
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CALLCAP_LOG_LEVEL") {
        config.host.log_level = val;
    }
    if let Ok(val) = std::env::var("CALLCAP_PERMISSION_TIMEOUT_MS")
        && let Ok(n) = val.parse()
    {
        config.permissions.load_timeout_ms = n;
    }
    if let Ok(val) = std::env::var("CALLCAP_USAGE_WINDOW_DAYS")
        && let Ok(n) = val.parse()
    {
        config.permissions.usage_window_days = n;
    }
}
