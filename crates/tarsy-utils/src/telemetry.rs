use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Initialize process-wide logging.
///
/// Bridges the `log` facade into `tracing` so that libraries emitting
/// plain `log` records show up in the same structured output, then
/// installs an `EnvFilter` + `fmt` subscriber.
///
/// # Environment Variables
/// - `RUST_LOG`: controls log filtering (via `EnvFilter`); defaults to `info`.
/// - `TARSY_LOG_JSON`: if set (any value), emits newline-delimited JSON instead
///   of the human-readable format.
pub fn setup_logging(service_name: &str) {
    LogTracer::init().expect("failed to install LogTracer");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("TARSY_LOG_JSON").is_ok() {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_current_span(true));
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    }

    tracing::info!(service = service_name, "logging initialized");
}
