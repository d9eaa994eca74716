//! resource-hub: bring up every configured backend resource, hold them
//! until SIGINT/SIGTERM, then close everything.

use clap::Parser;
use tracing::{error, info, warn};

use resource_hub::{BringUpError, ResourceHub, ResourceKind};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "resource-hub",
    version,
    about = "Connect databases, caches and object storage concurrently"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "resource-hub.example.yaml")]
    config: String,

    /// Keep running when some resources fail to come up.
    #[arg(long)]
    allow_partial: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = resource_hub::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    resource_hub::metrics::init_metrics()?;
    resource_hub::metrics::describe_metrics();
    info!("Prometheus metrics initialized");

    let hub = match ResourceHub::new(config).await {
        Ok(hub) => hub,
        Err(BringUpError::Partial(partial)) if cli.allow_partial => {
            for failure in &partial.failures {
                warn!("continuing without {}", failure);
            }
            partial.hub
        }
        Err(BringUpError::Partial(partial)) => {
            let failed = partial.failures.len();
            for failure in &partial.failures {
                error!("{}", failure);
            }
            if let Err(e) = partial.hub.close_all().await {
                error!("{}", e);
            }
            anyhow::bail!("{failed} resource(s) failed to come up");
        }
        Err(e) => return Err(e.into()),
    };

    for kind in [
        ResourceKind::Database,
        ResourceKind::Cache,
        ResourceKind::ObjectStorage,
    ] {
        info!("{}: {:?}", kind, hub.names(kind));
    }
    info!("resource-hub ready with {} resource(s)", hub.len());

    shutdown_signal().await?;

    hub.close_all().await?;
    info!("resource-hub shut down");

    Ok(())
}

/// Install the global subscriber.  `RUST_LOG` overrides `logging.level`.
fn init_tracing(logging: &resource_hub::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
    Ok(())
}
