use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use remediator::{
    audit::{create_sink, AuditLogger},
    config::Config,
    metrics,
    pipeline::Remediator,
    registry::ActionRegistry,
    server::Server,
};

const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// Alertmanager webhook receiver that runs guarded remediation actions.
#[derive(Debug, Parser)]
#[command(name = "remediator", version, about)]
struct Cli {
    /// Registry file (overrides REGISTRY_PATH)
    #[arg(long, value_name = "PATH")]
    registry: Option<PathBuf>,

    /// Listen address (overrides SERVER_ADDR)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Validate the registry, print the registered actions and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("invalid configuration")?;
    if let Some(path) = cli.registry {
        config.registry.path = path;
    }
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }
    info!("Loaded configuration: {:?}", config);

    let registry = ActionRegistry::from_file(&config.registry.path, config.registry.output_limit)
        .with_context(|| format!("loading registry {}", config.registry.path.display()))?;

    if cli.check {
        println!(
            "{}: {} remediation action(s)",
            config.registry.path.display(),
            registry.len()
        );
        for action in registry.actions() {
            println!(
                "  {:<24} {} {:?} timeout={:?} cooldown={:?} resource={}",
                action.match_identifier,
                action.describe(),
                action.raw_args(),
                action.timeout,
                action.cooldown,
                action.resource_label
            );
        }
        return Ok(());
    }

    metrics::register_metrics();

    // Initialize audit sink
    let sink = create_sink(&config.audit).await.context("creating audit sink")?;
    sink.init().await.context("initializing audit sink")?;
    let (audit, writer) = AuditLogger::start(sink, config.audit.queue_capacity);

    // running actions get their own timeout plus the output reader grace
    let drain_grace = registry.max_timeout() + SHUTDOWN_MARGIN;
    let remediator = Arc::new(Remediator::new(Arc::new(registry), audit.clone()));
    let server = Server::new(&config, Arc::clone(&remediator));

    info!("Starting server on {}", config.server.addr);
    let served = server.start(&config.server.addr).await;

    let pending = remediator.pending();
    let finished = remediator.drain(drain_grace).await;
    if finished.len() < pending {
        warn!(
            pending,
            finished = finished.len(),
            "Shut down with unfinished remediation pipelines"
        );
    }
    audit.flush().await;
    if writer.is_finished() {
        error!("Audit writer stopped before shutdown");
    }

    served.context("server error")
}
