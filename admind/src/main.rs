//! AdminD daemon
//!
//! Serves filesystem-delivered task requests until interrupted or until
//! the `shutdown` task is invoked.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use admind::{Admind, DAEMON_VERSION};
use admind_common::config::{config_path_from_env, load_config};
use admind_common::AdmindContext;

#[derive(Parser, Debug)]
#[command(name = "admind", version)]
#[command(about = "Filesystem-mediated task dispatcher")]
struct Cli {
    /// Path to an admind.toml configuration file (or use ADMIND_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory shared by all servers of this user
    #[arg(long)]
    root: Option<PathBuf>,

    /// Logical server name clients discover this process by
    #[arg(long)]
    server_name: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    info!("{}", admind_build_info::banner("admind", DAEMON_VERSION));

    let config_path = cli.config.clone().or_else(config_path_from_env);
    let config = load_config(config_path.as_deref());

    let mut context = AdmindContext::from_config(&config);
    if let Some(root) = cli.root {
        context = context.with_root(root);
    }
    if let Some(name) = cli.server_name {
        context = context.with_server_name(name);
    }

    info!(
        server = context.server_name(),
        dir = %context.working_dir().display(),
        "Starting AdminD"
    );

    let mut server = Admind::new(context);
    server.start();
    let shutdown = server.shutdown_handle();

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down"),
        _ = terminate() => info!("Received SIGTERM; shutting down"),
        _ = shutdown.requested() => info!("Shutdown task invoked; shutting down"),
    }

    let in_flight = server.in_flight();
    if in_flight > 0 {
        warn!(in_flight, "Stopping with tasks still running");
    }
    server.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
