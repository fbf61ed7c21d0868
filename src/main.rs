//! Main entry point for the kv-backup CLI

use anyhow::Context;
use clap::Parser;
use kv_backup::cli::{exit_code, Cli};
use kv_backup::metrics::init_metrics;
use kv_backup::shutdown::{SharedShutdown, ShutdownCoordinator, ShutdownRequest};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing(verbose: bool) {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let default_directive = if verbose {
        "kv_backup=debug"
    } else {
        "kv_backup=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Feed SIGINT (and SIGTERM on Unix) into the coordinator until forced exit
fn install_signal_handlers(shutdown: SharedShutdown) {
    tokio::spawn(async move {
        loop {
            if wait_for_signal().await.is_err() {
                warn!("Signal handling unavailable, shutdown only on completion");
                return;
            }
            if shutdown.request_shutdown() == ShutdownRequest::Force {
                return;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = init_metrics(addr).context("metrics endpoint unavailable") {
            warn!("Metrics disabled: {:#}", e);
        }
    }

    let shutdown = ShutdownCoordinator::shared();
    install_signal_handlers(shutdown.clone());

    let result = cli.execute(shutdown).await;
    if let Err(e) = &result {
        if e.is_interruption() {
            warn!("Backup interrupted: {}", e);
        } else {
            error!("Backup failed: {}", e);
        }
    }

    std::process::exit(exit_code(&result, cli.strict));
}
