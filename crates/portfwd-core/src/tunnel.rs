//! Tunnel pairs
//!
//! A [`Tunnel`] owns both endpoints of one relayed connection. The pairing is
//! structural: an endpoint never holds a pointer to its peer, the tunnel hands
//! out `(this, peer)` borrows on demand, so the two halves are always created
//! and dropped together.

use crate::endpoint::{Connection, Endpoint, Progress, Side};
use crate::interest::InterestSet;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub type TunnelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Remote dial in flight
    Connecting,
    Established,
    /// At least one direction has been shut down
    HalfClosing,
    /// Both endpoints want to close, waiting for buffers to drain
    Closing,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Established => "established",
            TunnelState::HalfClosing => "half-closing",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An I/O error attributed to one side of a tunnel
#[derive(Debug)]
pub struct Fault {
    pub side: Side,
    pub error: io::Error,
}

/// Result of running the relay pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Every step stopped on `WouldBlock` or a buffer condition
    Idle,
    /// The round budget ran out while bytes were still moving
    Yielded,
}

/// Byte counters for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_remote: u64,
    pub remote_to_client: u64,
    pub age: Duration,
}

pub struct Tunnel<C> {
    id: TunnelId,
    client: Endpoint<C>,
    remote: Endpoint<C>,
    state: TunnelState,
    opened_at: Instant,
}

impl<C: Connection> Tunnel<C> {
    /// Pair an accepted client with a remote connection that is still dialing.
    ///
    /// The client starts with no interest: nothing is read from it until the
    /// remote is connected. The remote waits for writability, which signals
    /// connect completion.
    pub fn new(id: TunnelId, client: C, remote: C, buffer_capacity: usize) -> Self {
        let client = Endpoint::new(Side::Client, client, buffer_capacity);
        let mut remote = Endpoint::new(Side::Remote, remote, buffer_capacity);
        remote.set_interest(InterestSet::WRITABLE);

        Self {
            id,
            client,
            remote,
            state: TunnelState::Connecting,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint<C> {
        match side {
            Side::Client => &self.client,
            Side::Remote => &self.remote,
        }
    }

    pub fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint<C> {
        match side {
            Side::Client => &mut self.client,
            Side::Remote => &mut self.remote,
        }
    }

    /// Borrow an endpoint together with its peer
    pub fn pair_mut(&mut self, side: Side) -> (&mut Endpoint<C>, &mut Endpoint<C>) {
        match side {
            Side::Client => (&mut self.client, &mut self.remote),
            Side::Remote => (&mut self.remote, &mut self.client),
        }
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            client_to_remote: self.remote.bytes_written(),
            remote_to_client: self.client.bytes_written(),
            age: self.opened_at.elapsed(),
        }
    }

    /// The remote dial finished: start relaying in both directions.
    pub fn establish(&mut self) {
        self.client.activate();
        self.remote.activate();
        self.state = TunnelState::Established;
    }

    /// Relay until nothing more can move, or `max_rounds` passes were made.
    ///
    /// Each pass runs the read step of every read-interested endpoint and the
    /// write step of every write-interested one. A step stopped by a buffer
    /// condition (rather than `WouldBlock`) gets retried on a later pass once
    /// the condition clears, so no readiness edge is ever waited on in vain.
    pub fn pump(&mut self, max_rounds: usize) -> Result<PumpStatus, Fault> {
        if !self.is_relaying() {
            return Ok(PumpStatus::Idle);
        }

        for _ in 0..max_rounds {
            let mut moved = false;
            for side in [Side::Client, Side::Remote] {
                moved |= self.read_step(side)?.made_progress();
                moved |= self.write_step(side.peer())?.made_progress();
            }
            self.refresh_state();
            if !moved {
                return Ok(PumpStatus::Idle);
            }
        }
        Ok(PumpStatus::Yielded)
    }

    pub fn read_step(&mut self, side: Side) -> Result<Progress, Fault> {
        let (this, peer) = self.pair_mut(side);
        if !this.interest().is_readable() {
            return Ok(Progress::default());
        }
        this.read_step(peer).map_err(|error| Fault { side, error })
    }

    pub fn write_step(&mut self, side: Side) -> Result<Progress, Fault> {
        let (this, peer) = self.pair_mut(side);
        if !this.interest().is_writable() {
            return Ok(Progress::default());
        }
        this.write_step(peer).map_err(|error| Fault { side, error })
    }

    /// An unrecoverable error hit `side`: mark the whole pair for closing.
    ///
    /// The failed side's pending bytes are dropped. The healthy side stops
    /// reading but may still flush what it already holds.
    pub fn fault(&mut self, side: Side) {
        let (this, peer) = self.pair_mut(side);
        this.abort();
        peer.begin_close();
        self.refresh_state();
    }

    /// Both endpoints want to close and neither holds unsent bytes.
    pub fn is_close_ready(&self) -> bool {
        self.client.wants_close()
            && self.remote.wants_close()
            && self.client.outbound().is_empty()
            && self.remote.outbound().is_empty()
    }

    /// Release both connections. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == TunnelState::Closed {
            return false;
        }
        self.client.release();
        self.remote.release();
        self.state = TunnelState::Closed;

        let stats = self.stats();
        info!(
            tunnel = self.id,
            client_to_remote = stats.client_to_remote,
            remote_to_client = stats.remote_to_client,
            duration_ms = stats.age.as_millis() as u64,
            "Tunnel closed"
        );
        true
    }

    fn is_relaying(&self) -> bool {
        !matches!(self.state, TunnelState::Connecting | TunnelState::Closed)
    }

    fn refresh_state(&mut self) {
        if !self.is_relaying() {
            return;
        }
        let next = if self.client.wants_close() && self.remote.wants_close() {
            TunnelState::Closing
        } else if [&self.client, &self.remote].iter().any(|e| {
            e.wants_close() || e.is_input_shut() || e.is_output_shut()
        }) {
            TunnelState::HalfClosing
        } else {
            TunnelState::Established
        };

        if next != self.state {
            debug!(tunnel = self.id, from = %self.state, to = %next, "Tunnel state changed");
            self.state = next;
        }
    }
}

impl<C> fmt::Debug for Tunnel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("client", &self.client)
            .field("remote", &self.remote)
            .finish()
    }
}
