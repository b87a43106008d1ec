//! Invoke a single task on a running AdminD server and report the outcome.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use admind_client::{AdmindClient, AsyncStatus};
use admind_common::config::{config_path_from_env, load_config};
use admind_common::AdmindContext;

#[derive(Parser, Debug)]
#[command(name = "admind-invoke", version)]
#[command(about = "Run one task on an AdminD server")]
struct Cli {
    /// Logical name of the target server
    #[arg(long)]
    server_name: Option<String>,

    /// Root directory holding the server directories
    #[arg(long)]
    root: Option<PathBuf>,

    /// Server working directory; skips discovery
    #[arg(long)]
    dir: Option<PathBuf>,

    /// How long to wait for the task to finish
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Task option (repeatable)
    #[arg(long = "option")]
    options: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Task name
    task: String,

    /// Request payload
    data: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(config_path_from_env().as_deref());
    let mut context = AdmindContext::from_config(&config);
    if let Some(root) = cli.root {
        context = context.with_root(root);
    }
    if let Some(name) = cli.server_name {
        context = context.with_server_name(name);
    }
    if let Some(ms) = cli.timeout_ms {
        context.wait_timeout = Duration::from_millis(ms);
    }

    let client = match cli.dir {
        Some(dir) => AdmindClient::attach(dir)
            .with_wait_timeout(context.wait_timeout)
            .with_max_attempts(context.max_invoke_attempts),
        None => AdmindClient::discover(&context)?,
    };

    let options: Vec<&str> = cli.options.iter().map(String::as_str).collect();
    let started = Instant::now();

    let request = client
        .invoke(&cli.task, &cli.data, &options)
        .await
        .with_context(|| format!("invoking '{}' in {}", cli.task, client.dir().display()))?;

    let status = client.wait_default(&request).await;
    println!("Request: {}", request);
    println!("Request data: {}", cli.data);

    let failed = match status {
        AsyncStatus::Ready => {
            let response = client.response(&request).await.unwrap_or_default();
            println!("Response: {}", String::from_utf8_lossy(&response));
            false
        }
        AsyncStatus::Gone => {
            println!("Response: <transaction gone>");
            true
        }
        _ => {
            if let Some(partial) = client.peek_response(&request).await {
                println!("Response: {}", String::from_utf8_lossy(&partial));
            }
            // A timed-out wait has already discarded the status
            let error = client
                .error(&request)
                .await
                .unwrap_or_else(|| "no status (wait timed out)".to_string());
            println!("Error: {}", error.trim_end());
            true
        }
    };

    println!("Running time: {} ms", started.elapsed().as_millis());

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
