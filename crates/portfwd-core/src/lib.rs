//! Transparent TCP port forwarding
//!
//! Accepts connections on a listening port and relays bytes in both
//! directions to one fixed remote address. All tunnels are multiplexed on a
//! single thread by a readiness-based [`Reactor`]; each tunnel pairs a client
//! [`Endpoint`] with a remote one, relaying through bounded buffers with
//! backpressure and half-close propagation.

pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod interest;
pub mod reactor;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use buffer::{RelayBuffer, DEFAULT_BUFFER_CAPACITY};
pub use config::ForwarderConfig;
pub use endpoint::{Connection, Endpoint, Progress, Side};
pub use error::ForwarderError;
pub use interest::InterestSet;
pub use reactor::{ForwarderHandle, Reactor};
pub use tunnel::{Fault, PumpStatus, Tunnel, TunnelId, TunnelState, TunnelStats};
