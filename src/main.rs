use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oracle_control_plane::app::OracleApp;
use oracle_control_plane::config::OracleConfig;

#[derive(Debug, Parser)]
#[command(name = "oracle-control-plane", version, about = "Decentralized oracle control plane")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "ORACLE_CONFIG")]
    config: Option<PathBuf>,

    /// Stable scheduler node identity.
    #[arg(long)]
    node_id: Option<String>,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = OracleConfig::load(cli.config.as_deref())?;
    if let Some(node_id) = cli.node_id {
        config.node_id = Some(node_id);
    }

    info!("Starting oracle control plane {}", OracleApp::version());
    let app = OracleApp::build(config).await?;
    app.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    app.shutdown().await;
    Ok(())
}
