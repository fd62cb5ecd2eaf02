//! Logging and metrics setup.
//!
//! The decoder only emits `tracing` events and `metrics` records. Installing
//! a subscriber or a recorder is left to the embedding application;
//! [`init_tracing`] is a convenience for binaries and tests.

pub mod metrics;

use tracing::info;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

use crate::config::TracingConfig;
use crate::error::{ErrorContext, Result};

/// Install a global subscriber with an `RUST_LOG` filter, falling back to
/// the configured level. Fails if a subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = Registry::default().with(env_filter);

    let installed = if config.json {
        subscriber
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(config.with_target).compact())
            .try_init()
    };
    installed.with_static_context("installing tracing subscriber")?;

    info!("Tracing initialization completed");
    Ok(())
}
