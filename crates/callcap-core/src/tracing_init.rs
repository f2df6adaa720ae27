//! Logging setup for callcap processes.
//!
//! Logs go to stderr. Stdout belongs to the bridge transport.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"callcap_host=info"`).
/// With `log_json` each event is written as one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let output: Box<dyn Layer<Registry> + Send + Sync> = if log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(output).with(filter).init();
}
