//! portfwd - transparent TCP port forwarder
//!
//! Relays every connection accepted on a local port to one remote host:port.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use portfwd_core::Reactor;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{build_settings, resolve, Args};

/// Setup logging; `RUST_LOG` wins over `--log-level` when set
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let settings = build_settings(&args).context("Failed to build configuration")?;
    let config = resolve(&settings).await?;

    info!(
        "Forwarding {} -> {}:{} ({})",
        config.listen_addr, settings.remote_host, settings.remote_port, config.remote_addr
    );

    let mut reactor = Reactor::bind(config).context("Cannot start forwarder")?;
    let handle = reactor.handle();

    // The reactor owns its thread; this task only waits for a shutdown signal
    let mut forwarder = tokio::task::spawn_blocking(move || reactor.run());

    let result = tokio::select! {
        result = &mut forwarder => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => error!("Error listening for shutdown signal: {}", e),
            }
            handle.stop();
            forwarder.await
        }
    };

    result
        .context("Forwarder thread panicked")?
        .context("Forwarder stopped with an error")?;

    info!("Bye");
    Ok(())
}
