//! sqlvault server
//!
//! SQLite over object storage with transactional client sessions.
//!
//! # Configuration
//!
//! `--config <path>` (or `SQLVAULT_CONFIG`) names a TOML file; environment
//! variables such as `PG_PORT` and `STORAGE` override it.

use clap::Parser;
use sqlvault_server::config::LoggingSection;
use sqlvault_server::{Server, ServerConfig};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// sqlvault database server.
#[derive(Parser)]
#[command(name = "sqlvault-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SQLVAULT_CONFIG", default_value = "sqlvault.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,
}

fn init_logging(logging: &LoggingSection, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.is_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = on_signal("SIGINT", tokio::signal::ctrl_c()) => {}
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; only SIGINT stops the server"),
        }
    }
    on_signal("SIGINT", tokio::signal::ctrl_c()).await;
}

/// Resolves when `listener` reports its signal. A listener that fails to
/// install never resolves, so it cannot trigger a shutdown by itself.
async fn on_signal(name: &str, listener: impl Future<Output = io::Result<()>>) {
    match listener.await {
        Ok(()) => info!(signal = name, "shutdown signal received"),
        Err(e) => {
            error!(signal = name, error = %e, "cannot listen for signal");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", toml::to_string_pretty(&ServerConfig::default())?);
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config)?;
    config.apply_env()?;
    init_logging(&config.logging, cli.verbose);
    info!(config = ?config, path = %cli.config.display(), "configuration loaded");

    let server = Server::start(config).await?;
    let report = server.run(wait_for_shutdown_signal()).await?;
    if !report.flushed {
        warn!("exiting without a confirmed final upload");
    }
    info!("sqlvault stopped");
    Ok(())
}
