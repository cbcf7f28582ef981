// Logging module for structured logging using the tracing crate

use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::filter::{filter_fn, FilterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::correlator::{CorrelatorLayer, UpstreamLogCorrelator, SOURCE_REQUEST_TARGET};

/// Initialize the tracing subscriber for structured logging
///
/// The subscriber is configured with:
/// - JSON or human-readable output to stdout
/// - `RUST_LOG` filtering, falling back to the configured level
/// - when a correlator is given, a layer that feeds upstream fetch records
///   into it; those records are never printed
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_subscriber(
    config: &LoggingConfig,
    correlator: Option<Arc<UpstreamLogCorrelator>>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let not_upstream_fetch = filter_fn(|meta| meta.target() != SOURCE_REQUEST_TARGET);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let correlator_layer = correlator.map(|correlator| {
        CorrelatorLayer::new(correlator)
            .with_filter(filter_fn(|meta| meta.target() == SOURCE_REQUEST_TARGET))
    });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter.and(not_upstream_fetch)))
        .with(correlator_layer)
        .try_init()?;

    Ok(())
}
