//! Observability utilities.
//!
//! Tracing is configured from the observability section of [`Config`]:
//! `log_level` seeds the filter and `json_logs` picks the output format.
//! The environment can override either knob at launch (`RUST_LOG` for the
//! filter, `TALLY_LOG_FORMAT=json`/`text` for the format), which is what
//! operators reach for when debugging a live scheduler without editing its
//! config file.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::{Config, ObservabilityConfig};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Filter from `RUST_LOG` when present, else the configured level.
fn level_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()))
}

/// Whether to emit JSON: an explicit `TALLY_LOG_FORMAT` wins, otherwise the
/// config decides.
fn wants_json(config: &ObservabilityConfig, env_format: Option<&str>) -> bool {
    match env_format {
        Some(format) => format.eq_ignore_ascii_case("json"),
        None => config.json_logs,
    }
}

/// Install the process-global tracing subscriber described by the config.
/// Later calls are no-ops, so library consumers and tests may call this
/// freely.
pub fn init_tracing(config: &Config) {
    TRACING_INIT.get_or_init(|| {
        let observability = &config.observability;
        let env_format = std::env::var("TALLY_LOG_FORMAT").ok();
        let registry = tracing_subscriber::registry().with(level_filter(observability));

        let result = if wants_json(observability, env_format.as_deref()) {
            registry.with(fmt::layer().json()).try_init()
        } else {
            registry.with(fmt::layer().compact()).try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
