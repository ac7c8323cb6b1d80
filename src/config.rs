//! Forwarder settings from the command line and an optional YAML file
//!
//! CLI values take precedence over the file. Nothing here touches the
//! network except hostname resolution, which happens once at startup.

use anyhow::{Context, Result};
use clap::Parser;
use portfwd_core::ForwarderConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Transparent TCP port forwarder
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "Forward every connection on a local port to a fixed remote host:port")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Accepts TCP connections on 0.0.0.0:<LISTEN_PORT> and relays bytes in both
directions to <REMOTE_HOST>:<REMOTE_PORT>, without looking at them.

EXAMPLES:
  # Expose a local PostgreSQL on port 5433
  portfwd 5433 127.0.0.1 5432

  # Read settings from a file, override the log level
  portfwd --config portfwd.yaml --log-level debug

ENVIRONMENT VARIABLES:
  PORTFWD_LISTEN_PORT   Port to listen on
  PORTFWD_REMOTE_HOST   Host to forward to
  PORTFWD_REMOTE_PORT   Port to forward to
"#)]
pub struct Args {
    /// Port to listen on (1-65535)
    #[arg(env = "PORTFWD_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Remote hostname or IP address
    #[arg(env = "PORTFWD_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// Remote port (1-65535)
    #[arg(env = "PORTFWD_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Relay buffer size per direction, in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum time a single readiness wait may block, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,

    #[serde(default)]
    pub remote: RemoteSection,

    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListenSection {
    pub port: Option<u16>,
    pub backlog: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelaySection {
    pub buffer_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

/// Settings after merging, before the remote host is resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub buffer_size: Option<usize>,
    pub poll_interval: Option<Duration>,
    pub backlog: Option<i32>,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn build_settings(args: &Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let listen_port = args
        .listen_port
        .or(file.listen.port)
        .ok_or_else(|| anyhow::anyhow!("Listen port is required (argument or config file)"))?;
    let remote_host = args
        .remote_host
        .clone()
        .or(file.remote.host)
        .ok_or_else(|| anyhow::anyhow!("Remote host is required (argument or config file)"))?;
    let remote_port = args
        .remote_port
        .or(file.remote.port)
        .ok_or_else(|| anyhow::anyhow!("Remote port is required (argument or config file)"))?;

    validate_port(listen_port, "listen")?;
    validate_port(remote_port, "remote")?;
    if remote_host.trim().is_empty() {
        anyhow::bail!("Remote host cannot be empty");
    }

    Ok(Settings {
        listen_port,
        remote_host,
        remote_port,
        buffer_size: args.buffer_size.or(file.relay.buffer_size),
        poll_interval: args
            .poll_interval_ms
            .or(file.relay.poll_interval_ms)
            .map(Duration::from_millis),
        backlog: args.backlog.or(file.listen.backlog),
    })
}

fn validate_port(port: u16, what: &str) -> Result<()> {
    if port == 0 {
        anyhow::bail!("{} is not a valid {} port number (expected 1-65535)", port, what);
    }
    Ok(())
}

/// Resolve the remote host and build the reactor configuration
pub async fn resolve(settings: &Settings) -> Result<ForwarderConfig> {
    let remote_addr: SocketAddr =
        tokio::net::lookup_host((settings.remote_host.as_str(), settings.remote_port))
            .await
            .with_context(|| format!("{} is not a valid hostname", settings.remote_host))?
            .next()
            .with_context(|| format!("{} resolved to no addresses", settings.remote_host))?;
    debug!("Resolved {} to {}", settings.remote_host, remote_addr.ip());

    let mut config =
        ForwarderConfig::new(settings.listen_port, remote_addr.ip(), remote_addr.port());
    if let Some(size) = settings.buffer_size {
        config = config.with_buffer_capacity(size);
    }
    if let Some(interval) = settings.poll_interval {
        config = config.with_poll_interval(interval);
    }
    if let Some(backlog) = settings.backlog {
        config = config.with_backlog(backlog);
    }

    config
        .validate()
        .context("Invalid forwarder configuration")?;
    Ok(config)
}
