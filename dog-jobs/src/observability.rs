//! Subscriber bootstrap for binaries and examples.
//!
//! The library itself only emits `tracing` events; call [`init_tracing`] once
//! from `main` to see them. Filtering follows `RUST_LOG` (default `info`).

use std::sync::Once;

use tracing_subscriber::{prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber. Later calls are no-ops.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(build_env_filter());
        let installed = match format {
            LogFormat::Text => registry
                .with(tracing_subscriber::fmt::layer().with_target(true).compact())
                .try_init(),
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().with_target(true).json())
                .try_init(),
        };

        if let Err(e) = installed {
            tracing::debug!(error = %e, "global subscriber already set");
        }
    });
}
