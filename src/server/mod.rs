// Server module - Pingora server assembly and background services

use async_trait::async_trait;
use pingora::server::configuration::Opt as ServerOpt;
use pingora_core::server::{Server, ShutdownWatch};
use pingora_core::services::background::{background_service, BackgroundService};
use std::sync::Arc;

use crate::classify::SourceClassifier;
use crate::config::Config;
use crate::correlator::{LogFollower, UpstreamLogCorrelator};
use crate::metrics::MetricsRegistry;
use crate::middleware::Instrumentation;
use crate::proxy::TileProxy;

/// Everything built from configuration before the server starts
pub struct Components {
    pub metrics: Arc<MetricsRegistry>,
    pub correlator: Arc<UpstreamLogCorrelator>,
    pub instrumentation: Arc<Instrumentation>,
}

impl Components {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let metrics = Arc::new(
            MetricsRegistry::new(&config.metrics)
                .map_err(|e| format!("Failed to create metrics registry: {}", e))?,
        );
        let correlator = Arc::new(UpstreamLogCorrelator::new(
            SourceClassifier::new(&config.sources),
            Arc::clone(&metrics),
        ));
        let instrumentation = Arc::new(Instrumentation::from_config(config, Arc::clone(&metrics)));

        Ok(Self {
            metrics,
            correlator,
            instrumentation,
        })
    }
}

/// Periodically rewrites this process's multi-process snapshot
pub struct SnapshotFlusher {
    metrics: Arc<MetricsRegistry>,
}

impl SnapshotFlusher {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl BackgroundService for SnapshotFlusher {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = tokio::time::interval(self.metrics.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = Arc::clone(&self.metrics);
                    match tokio::task::spawn_blocking(move || metrics.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Failed to flush metrics snapshot")
                        }
                        Err(e) => tracing::warn!(error = %e, "Metrics flush task failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Counters outlive this process in the compacted snapshot
                        let metrics = Arc::clone(&self.metrics);
                        match tokio::task::spawn_blocking(move || metrics.retire()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, "Failed to retire metrics snapshot")
                            }
                            Err(e) => tracing::warn!(error = %e, "Metrics retire task failed"),
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Runs a [`LogFollower`] for the lifetime of the server
pub struct UpstreamLogService {
    follower: LogFollower,
}

impl UpstreamLogService {
    pub fn new(follower: LogFollower) -> Self {
        Self { follower }
    }
}

#[async_trait]
impl BackgroundService for UpstreamLogService {
    async fn start(&self, shutdown: ShutdownWatch) {
        self.follower.run(shutdown).await;
    }
}

/// Build the Pingora server with the proxy and every configured background service
pub fn build_server(
    config: &Config,
    components: &Components,
    opt: ServerOpt,
) -> Result<Server, String> {
    let mut server =
        Server::new(Some(opt)).map_err(|e| format!("Failed to create Pingora server: {}", e))?;
    server.bootstrap();

    let proxy = TileProxy::new(Arc::clone(&components.instrumentation), &config.upstream);
    let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    let listen_addr = config.server.listen_addr();
    proxy_service.add_tcp(&listen_addr);
    proxy_service.threads = Some(config.server.threads);
    server.add_service(proxy_service);

    if components.metrics.is_multiprocess() {
        server.add_service(background_service(
            "metrics snapshot flusher",
            SnapshotFlusher::new(Arc::clone(&components.metrics)),
        ));
    }

    if let Some(log_config) = &config.upstream_log {
        let follower = LogFollower::from_config(log_config, Arc::clone(&components.correlator))
            .map_err(|e| format!("Invalid upstream_log.message_pattern: {}", e))?;
        server.add_service(background_service(
            "upstream log follower",
            UpstreamLogService::new(follower),
        ));
    }

    tracing::info!(
        address = %listen_addr,
        upstream = %config.upstream.address,
        dev_mode = config.dev_mode,
        multiprocess = components.metrics.is_multiprocess(),
        "Tile proxy configured"
    );

    Ok(server)
}
