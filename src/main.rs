use clap::Parser;
use pingora_core::server::configuration::Opt;
use std::path::PathBuf;
use tilegate::config::Config;
use tilegate::server::{build_server, Components};

/// Tilegate - metrics and cache policy for a tile-serving reverse proxy
#[derive(Parser, Debug)]
#[command(name = "tilegate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Daemon mode
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Test configuration and exit
    #[arg(long)]
    test: bool,

    /// Upgrade workers gracefully
    #[arg(long)]
    upgrade: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load and validate before logging exists, so errors go to stderr
    let config = Config::from_file(&args.config)
        .and_then(|config| config.validate().map(|_| config))
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    let components = Components::from_config(&config).map_err(anyhow::Error::msg)?;

    tilegate::logging::init_subscriber(&config.logging, Some(components.correlator.clone()))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging subsystem: {}", e))?;

    tracing::info!(
        config_file = %args.config.display(),
        cache_root = %config.cache.root.display(),
        manifest_dir = %config.manifests.dir.display(),
        upstream_log = config.upstream_log.is_some(),
        "Configuration loaded successfully"
    );

    let opt = Opt {
        daemon: args.daemon,
        test: args.test,
        upgrade: args.upgrade,
        ..Default::default()
    };

    let server = build_server(&config, &components, opt).map_err(anyhow::Error::msg)?;

    tracing::info!("Starting tilegate");
    server.run_forever();
}
