//! One side of a tunnel
//!
//! An [`Endpoint`] wraps a single non-blocking connection (the accepted client
//! or the dialed remote) together with the buffer of bytes waiting to be
//! written to it. Reads are cross-writes: bytes read from an endpoint's socket
//! land in its *peer's* outbound buffer, so every step takes the peer as an
//! argument. The pairing itself lives in [`Tunnel`](crate::tunnel::Tunnel).

use crate::buffer::RelayBuffer;
use crate::interest::InterestSet;
use mio::event::Source;
use mio::{Registry, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use tracing::{debug, info};

/// A byte stream that can be half-closed.
///
/// Implemented for `mio::net::TcpStream`; the seam exists so the relay state
/// machine can run against in-memory connections in tests.
pub trait Connection: Read + Write {
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Connection for mio::net::TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Remote,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Remote,
            Side::Remote => Side::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single read or write step accomplished
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes: usize,
    /// A half of a connection was shut down during the step
    pub half_closed: bool,
}

impl Progress {
    pub fn made_progress(&self) -> bool {
        self.bytes > 0 || self.half_closed
    }
}

pub struct Endpoint<C> {
    side: Side,
    conn: C,
    /// Bytes destined for this endpoint's socket, filled by the peer's reads
    outbound: RelayBuffer,
    interest: InterestSet,
    registered: Option<InterestSet>,
    want_shutdown_input: bool,
    want_shutdown_output: bool,
    want_close: bool,
    input_shut: bool,
    output_shut: bool,
    bytes_written: u64,
}

impl<C: Connection> Endpoint<C> {
    pub fn new(side: Side, conn: C, buffer_capacity: usize) -> Self {
        Self {
            side,
            conn,
            outbound: RelayBuffer::with_capacity(buffer_capacity),
            interest: InterestSet::NONE,
            registered: None,
            want_shutdown_input: false,
            want_shutdown_output: false,
            want_close: false,
            input_shut: false,
            output_shut: false,
            bytes_written: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn outbound(&self) -> &RelayBuffer {
        &self.outbound
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    pub fn wants_shutdown_input(&self) -> bool {
        self.want_shutdown_input
    }

    pub fn wants_shutdown_output(&self) -> bool {
        self.want_shutdown_output
    }

    pub fn wants_close(&self) -> bool {
        self.want_close
    }

    pub fn is_input_shut(&self) -> bool {
        self.input_shut
    }

    pub fn is_output_shut(&self) -> bool {
        self.output_shut
    }

    /// Total bytes written to this endpoint's socket
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Start relaying: both directions begin read-interested.
    pub(crate) fn activate(&mut self) {
        self.interest = InterestSet::READABLE;
        if !self.outbound.is_empty() {
            self.interest.insert(InterestSet::WRITABLE);
        }
    }

    pub(crate) fn set_interest(&mut self, interest: InterestSet) {
        self.interest = interest;
    }

    /// Read everything currently available into the peer's outbound buffer.
    ///
    /// Stops on `WouldBlock`, on end-of-stream, or when the peer's buffer is
    /// full. In the last case read interest is withdrawn until the peer's
    /// [`write_step`](Self::write_step) frees space again.
    pub fn read_step(&mut self, peer: &mut Endpoint<C>) -> io::Result<Progress> {
        let mut progress = Progress::default();

        loop {
            if peer.outbound.is_full() {
                self.interest.remove(InterestSet::READABLE);
                debug!(side = %self.side, "Peer buffer full, pausing reads");
                break;
            }

            match peer.outbound.fill_from(&mut self.conn) {
                Ok(0) => {
                    self.finish_input(peer)?;
                    progress.half_closed = true;
                    break;
                }
                Ok(n) => progress.bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if progress.bytes > 0 {
            peer.interest.insert(InterestSet::WRITABLE);
            debug!(side = %self.side, bytes = progress.bytes, "Read");
        }

        Ok(progress)
    }

    /// Flush as much of the outbound buffer as the socket accepts.
    ///
    /// Once the buffer is empty, write interest is withdrawn, and a pending
    /// output shutdown is carried out. Freed space re-enables reading on the
    /// peer if it was paused by backpressure.
    pub fn write_step(&mut self, peer: &mut Endpoint<C>) -> io::Result<Progress> {
        let mut progress = Progress::default();

        while !self.outbound.is_empty() {
            match self.outbound.drain_into(&mut self.conn) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection accepted no bytes",
                    ))
                }
                Ok(n) => progress.bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if progress.bytes > 0 {
            self.bytes_written += progress.bytes as u64;
            peer.resume_reading();
            debug!(side = %self.side, bytes = progress.bytes, "Wrote");
        }

        if self.outbound.is_empty() {
            self.interest.remove(InterestSet::WRITABLE);
            if self.want_shutdown_output && !self.output_shut {
                self.shutdown_output()?;
                progress.half_closed = true;
            }
        }

        Ok(progress)
    }

    /// The socket reported end-of-stream: stop reading, shut the inbound half
    /// and ask the peer to shut its outbound half once it has drained.
    fn finish_input(&mut self, peer: &mut Endpoint<C>) -> io::Result<()> {
        self.interest.remove(InterestSet::READABLE);
        self.want_shutdown_input = true;
        self.shutdown_input()?;

        peer.want_shutdown_output = true;
        if peer.outbound.is_empty() && !peer.output_shut {
            peer.shutdown_output()?;
        }
        Ok(())
    }

    fn shutdown_input(&mut self) -> io::Result<()> {
        if self.input_shut {
            return Ok(());
        }
        shutdown_ignoring_disconnect(&self.conn, Shutdown::Read)?;
        self.input_shut = true;
        info!(side = %self.side, "Shutdown input");
        self.check_close();
        Ok(())
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        if self.output_shut {
            return Ok(());
        }
        shutdown_ignoring_disconnect(&self.conn, Shutdown::Write)?;
        self.output_shut = true;
        self.interest.remove(InterestSet::WRITABLE);
        info!(side = %self.side, "Shutdown output");
        self.check_close();
        Ok(())
    }

    /// Both halves are done: this endpoint is ready to be closed.
    fn check_close(&mut self) {
        if self.input_shut && self.output_shut {
            self.want_close = true;
        }
    }

    fn resume_reading(&mut self) {
        if !self.want_shutdown_input && !self.want_close && !self.interest.is_readable() {
            self.interest.insert(InterestSet::READABLE);
            debug!(side = %self.side, "Resuming reads");
        }
    }

    /// This endpoint's connection failed. Its pending bytes can never be
    /// delivered, so they are dropped along with all interest.
    pub(crate) fn abort(&mut self) {
        self.outbound.clear();
        self.interest = InterestSet::NONE;
        self.want_close = true;
        self.input_shut = true;
        self.output_shut = true;
        let _ = self.conn.shutdown(Shutdown::Both);
    }

    /// The peer failed: accept no more input, but keep flushing whatever is
    /// already buffered for this socket.
    pub(crate) fn begin_close(&mut self) {
        self.want_close = true;
        self.interest.remove(InterestSet::READABLE);
    }

    pub(crate) fn release(&mut self) {
        self.interest = InterestSet::NONE;
        let _ = self.conn.shutdown(Shutdown::Both);
    }
}

impl<C: Connection + Source> Endpoint<C> {
    /// Bring the registry in line with the wanted interest set.
    pub(crate) fn sync_registration(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wanted = self.interest;
        match (self.registered, wanted.to_mio()) {
            (Some(current), _) if current == wanted => return Ok(()),
            (None, None) => return Ok(()),
            (None, Some(interest)) => registry.register(&mut self.conn, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(&mut self.conn, token, interest)?,
            (Some(_), None) => registry.deregister(&mut self.conn)?,
        }
        debug!(side = %self.side, interest = ?wanted, "Interest updated");
        self.registered = if wanted.is_empty() { None } else { Some(wanted) };
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.conn);
        }
    }
}

impl<C> fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("side", &self.side)
            .field("outbound", &self.outbound)
            .field("interest", &self.interest)
            .field("want_shutdown_input", &self.want_shutdown_input)
            .field("want_shutdown_output", &self.want_shutdown_output)
            .field("want_close", &self.want_close)
            .finish()
    }
}

/// A peer that already went away makes shutdown report `NotConnected`;
/// the half is gone either way.
fn shutdown_ignoring_disconnect<C: Connection>(conn: &C, how: Shutdown) -> io::Result<()> {
    match conn.shutdown(how) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
