use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use veilproxy::{Cli, PoolConfig, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let config = cli
        .resolve()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let supervisor = Supervisor::new(PoolConfig {
        min_size: cli.min_tunnels,
        max_size: cli.max_tunnels,
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(supervisor.log_layer());

    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    supervisor.start(config).await?;

    shutdown_signal().await;
    supervisor.stop().await;
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
