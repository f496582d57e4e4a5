//! Observability utilities.
//!
//! Process-wide tracing setup plus the access logger invoked once for every
//! completed tour.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::tour::Tour;
use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `BAYSERVER_LOG_FORMAT=json` or `observability.json_logs`. Filter comes from
/// `RUST_LOG`, falling back to the configured level.
pub fn init_tracing(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
        let json = std::env::var("BAYSERVER_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(config.json_logs);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// Collaborator invoked once per completed tour.
pub trait TourLogger: std::fmt::Debug + Send + Sync {
    fn log(&self, tour: &Tour);
}

/// Default access log, emitted on the `bayserver::access` target.
#[derive(Debug, Default)]
pub struct AccessLog;

impl TourLogger for AccessLog {
    fn log(&self, tour: &Tour) {
        let elapsed_ms = tour
            .started_at()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let remote = tour
            .req
            .remote
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            target: "bayserver::access",
            time = %chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z"),
            remote = %remote,
            method = %tour.req.method,
            uri = %tour.req.uri,
            status = tour.res.status(),
            bytes = tour.res.bytes_sent(),
            elapsed_ms,
            tour = %tour.tour_id(),
            aborted = tour.is_aborted(),
        );
    }
}
