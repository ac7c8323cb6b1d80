//! Single-threaded relay reactor
//!
//! One `mio::Poll` drives the listening socket and every tunnel endpoint.
//! Each wake is dispatched by token: the listener accepts and dials, a remote
//! that is still connecting finishes its dial, and any other endpoint event
//! pumps its tunnel until it would block. Interest changes made by the relay
//! steps are pushed to the registry once per dispatch.
//!
//! Tokens: `0` is the listener, `1` the stop waker, and each tunnel `id`
//! owns `2 + 2 * id` (client) and `3 + 2 * id` (remote).

use crate::config::ForwarderConfig;
use crate::endpoint::Side;
use crate::error::ForwarderError;
use crate::tunnel::{PumpStatus, Tunnel, TunnelId, TunnelState};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, debug_span, error, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_TUNNEL_TOKEN: usize = 2;

/// Relay passes a tunnel may make per wake before yielding to others
const PUMP_ROUNDS: usize = 16;

const EVENTS_CAPACITY: usize = 1024;

fn token_for(id: TunnelId, side: Side) -> Token {
    let slot = match side {
        Side::Client => 0,
        Side::Remote => 1,
    };
    Token(FIRST_TUNNEL_TOKEN + (id as usize) * 2 + slot)
}

fn tunnel_for(token: Token) -> Option<(TunnelId, Side)> {
    let raw = token.0.checked_sub(FIRST_TUNNEL_TOKEN)?;
    let side = if raw % 2 == 0 {
        Side::Client
    } else {
        Side::Remote
    };
    Some(((raw / 2) as TunnelId, side))
}

/// Control handle for a running [`Reactor`]
///
/// Cloneable and usable from any thread.
#[derive(Clone)]
pub struct ForwarderHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    active: Arc<AtomicUsize>,
}

impl ForwarderHandle {
    /// Ask the reactor to stop at its next loop iteration
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake reactor: {}", e);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Number of live tunnel pairs
    pub fn active_tunnels(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct Reactor {
    config: ForwarderConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    tunnels: HashMap<TunnelId, Tunnel<TcpStream>>,
    next_id: TunnelId,
    /// Tunnels that ran out of pump rounds and must be driven again
    yielded: Vec<TunnelId>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    active: Arc<AtomicUsize>,
}

impl Reactor {
    /// Validate the configuration and bind the listening socket.
    pub fn bind(config: ForwarderConfig) -> Result<Self, ForwarderError> {
        config.validate()?;

        let poll = Poll::new()?;
        let mut listener = bind_listener(&config)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!(
            "Listening on {}, forwarding to {}",
            local_addr, config.remote_addr
        );

        Ok(Self {
            config,
            poll,
            listener,
            local_addr,
            tunnels: HashMap::new(),
            next_id: 0,
            yielded: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            waker,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ForwarderHandle {
        ForwarderHandle {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
            active: self.active.clone(),
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Run until [`ForwarderHandle::stop`] is called.
    ///
    /// Per-connection failures never end the loop; only a failing readiness
    /// wait does. On stop every live tunnel is closed without draining.
    pub fn run(&mut self) -> Result<(), ForwarderError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested");
                break;
            }

            let timeout = if self.yielded.is_empty() {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if let Err(e) = self.dispatch(event) {
                    error!("Unexpected error handling {:?}: {}", event.token(), e);
                }
            }

            for id in std::mem::take(&mut self.yielded) {
                self.drive(id);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), ForwarderError> {
        match event.token() {
            LISTENER => self.accept_pending(),
            WAKER => Ok(()),
            token => {
                let Some((id, side)) = tunnel_for(token) else {
                    return Ok(());
                };
                self.handle_tunnel_event(id, side, event);
                Ok(())
            }
        }
    }

    /// Accept until the listen queue is empty (the listener is edge-triggered).
    fn accept_pending(&mut self) -> Result<(), ForwarderError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open_tunnel(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn open_tunnel(&mut self, client: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        let remote_addr = self.config.remote_addr;

        info!(tunnel = id, peer = %peer, "Received connection");

        let remote = match TcpStream::connect(remote_addr) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    tunnel = id,
                    remote = %remote_addr,
                    error = %e,
                    "Failed to connect to remote, dropping client"
                );
                return;
            }
        };
        debug!(tunnel = id, remote = %remote_addr, "Connecting to remote");

        if let Err(e) = client.set_nodelay(true) {
            debug!(tunnel = id, error = %e, "Failed to set TCP_NODELAY on client");
        }

        let mut tunnel = Tunnel::new(id, client, remote, self.config.buffer_capacity);
        let registry = self.poll.registry();
        if let Err(e) = tunnel
            .endpoint_mut(Side::Remote)
            .sync_registration(registry, token_for(id, Side::Remote))
        {
            warn!(tunnel = id, error = %e, "Failed to register remote connection");
            tunnel.close();
            return;
        }

        self.tunnels.insert(id, tunnel);
        self.active.store(self.tunnels.len(), Ordering::SeqCst);
    }

    fn handle_tunnel_event(&mut self, id: TunnelId, side: Side, event: &Event) {
        let Some(tunnel) = self.tunnels.get_mut(&id) else {
            trace!(tunnel = id, side = %side, "Event for closed tunnel");
            return;
        };

        match tunnel.state() {
            TunnelState::Connecting => {
                if side == Side::Remote {
                    self.finish_connect(id);
                }
            }
            TunnelState::Closed => {}
            _ if event.is_error() => {
                let error = take_socket_error(tunnel.endpoint(side).conn());
                warn!(tunnel = id, side = %side, error = %error, "Connection error, closing pair");
                tunnel.fault(side);
                self.drive(id);
            }
            _ => self.drive(id),
        }
    }

    /// The remote signalled writability while dialing: find out whether the
    /// connect succeeded.
    fn finish_connect(&mut self, id: TunnelId) {
        let Some(tunnel) = self.tunnels.get_mut(&id) else {
            return;
        };

        let remote = tunnel.endpoint(Side::Remote).conn();
        let outcome = connect_outcome(remote.take_error(), || remote.peer_addr());

        match outcome {
            Ok(Some(addr)) => {
                info!(tunnel = id, remote = %addr, "Connected to remote");
                if let Err(e) = remote.set_nodelay(true) {
                    debug!(tunnel = id, error = %e, "Failed to set TCP_NODELAY on remote");
                }
                tunnel.establish();
                self.drive(id);
            }
            Ok(None) => trace!(tunnel = id, "Connect still in progress"),
            Err(e) => {
                warn!(
                    tunnel = id,
                    remote = %self.config.remote_addr,
                    error = %e,
                    "Failed to connect to remote, dropping client"
                );
                self.close_tunnel(id);
            }
        }
    }

    /// Relay what can be relayed, then close the pair or sync its interest.
    fn drive(&mut self, id: TunnelId) {
        let Some(tunnel) = self.tunnels.get_mut(&id) else {
            return;
        };
        let _span = debug_span!("tunnel", id).entered();

        // A fault takes away the failed side's interest, so this runs at most
        // once per side.
        let status = loop {
            match tunnel.pump(PUMP_ROUNDS) {
                Ok(status) => break status,
                Err(fault) => {
                    warn!(
                        tunnel = id,
                        side = %fault.side,
                        error = %fault.error,
                        "Lost connection, closing pair"
                    );
                    tunnel.fault(fault.side);
                }
            }
        };

        if tunnel.is_close_ready() {
            debug!(tunnel = id, "Both sides finished");
            self.close_tunnel(id);
            return;
        }

        let registry = self.poll.registry();
        if let Err(e) = sync_tunnel(registry, tunnel) {
            warn!(tunnel = id, error = %e, "Failed to update interest, closing pair");
            self.close_tunnel(id);
            return;
        }

        if status == PumpStatus::Yielded {
            self.yielded.push(id);
        }
    }

    fn close_tunnel(&mut self, id: TunnelId) {
        if let Some(mut tunnel) = self.tunnels.remove(&id) {
            let registry = self.poll.registry();
            tunnel.endpoint_mut(Side::Client).deregister(registry);
            tunnel.endpoint_mut(Side::Remote).deregister(registry);
            tunnel.close();
        }
        self.active.store(self.tunnels.len(), Ordering::SeqCst);
    }

    fn shutdown(&mut self) {
        let ids: Vec<TunnelId> = self.tunnels.keys().copied().collect();
        if !ids.is_empty() {
            info!("Closing {} active tunnel(s)", ids.len());
        }
        for id in ids {
            self.close_tunnel(id);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!("Forwarder stopped");
    }
}

fn sync_tunnel(registry: &Registry, tunnel: &mut Tunnel<TcpStream>) -> io::Result<()> {
    let id = tunnel.id();
    for side in [Side::Client, Side::Remote] {
        tunnel
            .endpoint_mut(side)
            .sync_registration(registry, token_for(id, side))?;
    }
    Ok(())
}

/// Classify a writable wake on a dialing socket: `Ok(Some(peer))` once
/// connected, `Ok(None)` while the handshake is still in flight.
fn connect_outcome(
    pending_error: io::Result<Option<io::Error>>,
    peer_addr: impl FnOnce() -> io::Result<SocketAddr>,
) -> io::Result<Option<SocketAddr>> {
    match pending_error {
        Ok(Some(e)) | Err(e) => Err(e),
        Ok(None) => match peer_addr() {
            Ok(addr) => Ok(Some(addr)),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(e) => Err(e),
        },
    }
}

fn take_socket_error(stream: &TcpStream) -> io::Error {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => e,
        Ok(None) => io::Error::new(io::ErrorKind::Other, "socket reported an error condition"),
    }
}

fn bind_listener(config: &ForwarderConfig) -> Result<TcpListener, ForwarderError> {
    let addr = config.listen_addr;
    let bind_error = |e: io::Error| ForwarderError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(config.backlog).map_err(bind_error)?;

    Ok(TcpListener::from_std(socket.into()))
}
