//! Botwarden RPC Server - HTTP control surface for the assistant supervisor.
//!
//! This binary wraps the botwarden library and exposes start/stop/restart,
//! status, message relay and log endpoints over HTTP.

mod handlers;
mod server;

use anyhow::Result;
use botwarden::SupervisorSettings;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "botwarden-rpc")]
#[command(about = "HTTP control server for the assistant supervisor")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Assistant project directory (overrides RASA_PROJECT_DIR)
    #[arg(long)]
    project_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Botwarden RPC Server");

    let project_dir = args.project_dir.clone();
    let settings = SupervisorSettings::from_lookup(|key| match (key, &project_dir) {
        ("RASA_PROJECT_DIR", Some(dir)) => Some(dir.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })?;

    info!("Project directory: {}", settings.project_dir.display());
    info!("Model directory: {}", settings.artifact_dir.display());
    info!("Log directory: {}", settings.log_dir.display());
    info!("General log directory: {}", settings.general_log_dir.display());

    let state = Arc::new(server::AppState::new(settings)?);
    let addr = server::start_server(state.clone(), &args.host, args.port).await?;

    info!("RPC server running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping supervised processes");

    match state.controller.stop().await {
        Ok(outcome) => info!("{}", outcome.message()),
        Err(e) => warn!("Failed to stop assistant server on shutdown: {}", e),
    }

    Ok(())
}
