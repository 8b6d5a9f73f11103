//! stws-presence daemon
//!
//! Connects to the StellwerkSim communicator and mirrors the running
//! session into Discord Rich Presence.

mod communicator;
mod ipc;
mod observer;
mod orchestrator;
mod presence;
mod probe;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use crate::ipc::IpcServer;
use crate::observer::{LoggingObserver, SharedStatus};
use crate::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "stws-presenced")]
#[command(about = "StellwerkSim rich presence daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file [default: ~/.config/stws-presence/config.kdl]
    #[arg(short, long)]
    config: Option<String>,

    /// Communicator host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Communicator port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config first, so its log level can seed the filter
    let (mut config, config_path) = stws_presence_config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.global.log_level.as_str())),
        )
        .init();

    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => tracing::info!("No configuration file, using defaults"),
    }

    if let Some(host) = args.host {
        config.communicator.host = host;
    }
    if let Some(port) = args.port {
        config.communicator.port = port;
    }

    let status = SharedStatus::new();
    let ipc_task = match IpcServer::new() {
        Ok(server) => Some(tokio::spawn(server.serve(status.clone()))),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "Status socket unavailable");
            None
        }
    };

    let (mut orchestrator, shutdown) = Orchestrator::new(config);
    orchestrator.add_observer(Arc::new(LoggingObserver));
    orchestrator.add_observer(Arc::new(status));

    let orchestrator_task = tokio::spawn(orchestrator.run());

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Received Ctrl-C");
        }
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down...");
    shutdown.stop();
    shutdown.wait_stopped().await;
    orchestrator_task.await.context("Orchestrator task failed")?;

    if let Some(task) = ipc_task {
        // Dropping the server removes the socket file
        task.abort();
        let _ = task.await;
    }

    Ok(())
}
