//! Main entry point for the lanshare CLI application.
//!
//! Starts the file server on the given paths, prints the addresses other
//! devices can use, and runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use lanshare::{Cli, ServerLifecycle, list_local_addresses};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let roots = cli
        .shared_roots()
        .context("failed to resolve shared paths")?;
    let server = ServerLifecycle::new(cli.server_config());
    let addr = server
        .start(cli.port, &roots)
        .await
        .with_context(|| format!("failed to start server on port {}", cli.port))?;

    let shared = server.shared_paths().await?;
    if shared.is_empty() {
        eprintln!("Warning: none of the given paths could be shared");
    }
    for entry in &shared {
        println!("  sharing: /{}  ->  {}", entry.name, entry.path.display());
    }

    let ips = list_local_addresses();
    if ips.is_empty() || !addr.ip().is_unspecified() {
        println!("\nOpen http://{addr}/ in a browser");
    } else {
        println!("\nOpen one of these addresses on another device:");
        for ip in ips {
            println!("  http://{}:{}/", ip, addr.port());
        }
    }
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("interrupt received");
    server.stop().await?;
    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(cli.log_filter())
            .context("invalid log filter")?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
