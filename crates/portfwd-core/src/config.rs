//! Forwarder configuration

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::error::ForwarderError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const MIN_BUFFER_CAPACITY: usize = 1024;
pub const MAX_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Address the listening socket binds to
    pub listen_addr: SocketAddr,

    /// Fixed destination every accepted connection is relayed to
    pub remote_addr: SocketAddr,

    /// Capacity of each per-direction relay buffer
    pub buffer_capacity: usize,

    /// Upper bound on a single readiness wait
    pub poll_interval: Duration,

    /// Listen queue length
    pub backlog: i32,
}

impl ForwarderConfig {
    /// Listen on `0.0.0.0:<listen_port>` and relay to `remote_ip:remote_port`
    pub fn new(listen_port: u16, remote_ip: IpAddr, remote_port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port),
            remote_addr: SocketAddr::new(remote_ip, remote_port),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn validate(&self) -> Result<(), ForwarderError> {
        if self.remote_addr.port() == 0 {
            return Err(ForwarderError::InvalidConfig(
                "remote port must be between 1 and 65535".to_string(),
            ));
        }
        if !(MIN_BUFFER_CAPACITY..=MAX_BUFFER_CAPACITY).contains(&self.buffer_capacity) {
            return Err(ForwarderError::InvalidConfig(format!(
                "buffer capacity {} is outside {}..={} bytes",
                self.buffer_capacity, MIN_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ForwarderError::InvalidConfig(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ForwarderError::InvalidConfig(format!(
                "backlog must be positive, got {}",
                self.backlog
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ForwarderConfig {
        ForwarderConfig::new(8080, "10.0.0.1".parse().unwrap(), 80)
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.remote_addr, "10.0.0.1:80".parse().unwrap());
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = config()
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_buffer_capacity(4096)
            .with_poll_interval(Duration::from_millis(10))
            .with_backlog(16);
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.buffer_capacity, 4096);
        assert_eq!(config.backlog, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero_port = ForwarderConfig::new(8080, "10.0.0.1".parse().unwrap(), 0);
        assert!(matches!(
            zero_port.validate(),
            Err(ForwarderError::InvalidConfig(_))
        ));

        assert!(config().with_buffer_capacity(16).validate().is_err());
        assert!(config()
            .with_buffer_capacity(MAX_BUFFER_CAPACITY + 1)
            .validate()
            .is_err());
        assert!(config()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(config().with_backlog(0).validate().is_err());
    }
}
