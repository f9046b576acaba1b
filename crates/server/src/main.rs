use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod session;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "roster")]
#[command(about = "MCP server exposing a user directory over SSE", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "roster.toml")]
    config: PathBuf,

    /// Data directory for the user document
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster=info,tower_http=debug".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Roster MCP server");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await?;

    Ok(())
}
