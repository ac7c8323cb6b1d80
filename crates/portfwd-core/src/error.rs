use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 usually need elevated privileges\n  • Try using a different port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}
