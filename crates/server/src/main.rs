use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod middleware;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "flowrun")]
#[command(about = "Multi-tenant flow execution orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "flowrun.toml", env = "FLOWRUN_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "FLOWRUN_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrun=info,flowrun_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting flowrun");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    tracing::info!(
        workers = config.engine.worker_count,
        tenants = config.tenants.len(),
        "Loaded configuration"
    );

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
