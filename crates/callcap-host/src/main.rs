//! callcap Host
//!
//! Runs the capability routing core behind a newline-delimited JSON bridge
//! on stdin/stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use callcap_host::provider::{HostContext, ProvidersConfig};
use callcap_host::storage::{Database, SqlitePermissionStore};
use callcap_host::{Host, HostOptions};

#[derive(Parser, Debug)]
#[command(name = "callcap-host")]
#[command(version, about = "callcap host - capability routing for in-call mini-apps")]
struct Args {
    /// Permission database file path
    #[arg(long, env = "CALLCAP_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Provider declaration file (TOML)
    #[arg(long, env = "CALLCAP_PROVIDERS")]
    providers: Option<PathBuf>,

    /// Extra settings file layered over the global one (JSON)
    #[arg(long, env = "CALLCAP_CONFIG")]
    config: Option<PathBuf>,

    /// Private data directory handed to providers
    #[arg(long, env = "CALLCAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Host name reported to providers
    #[arg(long, default_value = "callcap-host", env = "CALLCAP_HOST_NAME")]
    host_name: String,

    /// Log level filter (e.g. "info", "debug", "warn"). Overrides settings.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CALLCAP_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = callcap_core::config::load_config(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    callcap_core::tracing_init::init_tracing(
        &format!("callcap_host={log_level},callcap_core={log_level}"),
        args.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host_name = %args.host_name,
        "Starting callcap-host"
    );

    let db_path = match args.db_path.or(config.host.database_path) {
        Some(path) => path,
        None => default_path("permissions.db", callcap_core::config::database_path())?,
    };
    info!(path = %db_path.display(), "Opening permission database");
    let db = Database::open(&db_path).await?;

    let data_dir = match args.data_dir.or(config.host.data_dir) {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let ctx = HostContext::new(data_dir, args.host_name);

    let mut options = HostOptions::new(ctx, Arc::new(SqlitePermissionStore::new(db)));
    options.permissions = config.permissions;
    let host = Arc::new(Host::new(options));

    let providers_path = match args.providers.or(config.host.providers_path) {
        Some(path) => path,
        None => default_path("providers.toml", callcap_core::config::providers_path())?,
    };
    let providers = ProvidersConfig::load(&providers_path)?;
    for (id, provider) in providers.build_providers() {
        host.register_provider(&id, provider).await;
    }

    let registered = host.registry().provider_count().await;
    let ready = host.init().await;
    if ready < registered {
        warn!(registered, ready, "Some capability providers failed to initialise");
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    info!(providers = registered, "Bridge ready");

    tokio::select! {
        result = callcap_host::stdio::run_stdio(Arc::clone(&host), stdin, stdout) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    host.release().await;
    info!("Host stopped");
    Ok(())
}

/// Resolve a default state file, falling back to `~/.callcap/<name>`.
fn default_path(name: &str, configured: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".callcap").join(name))
}

/// Default provider data directory: `<data dir>/callcap`.
fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    Ok(base.join("callcap"))
}
