//! In-memory connection for exercising the relay state machine without sockets

use crate::endpoint::Connection;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;

#[derive(Default)]
struct FakeState {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    read_error: Option<io::ErrorKind>,
    write_budget: usize,
    write_error: Option<io::ErrorKind>,
    written: Vec<u8>,
    shutdowns: Vec<Shutdown>,
}

/// Cloneable handle: the test keeps one copy, the endpoint owns the other.
///
/// Reads return `WouldBlock` when nothing is queued and `Ok(0)` once the
/// inbound side is closed. Writes accept only as many bytes as were granted.
#[derive(Clone, Default)]
pub struct FakeConn {
    state: Rc<RefCell<FakeState>>,
}

impl FakeConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection whose writes never block
    pub fn unlimited() -> Self {
        let conn = Self::new();
        conn.grant(usize::MAX);
        conn
    }

    pub fn push_inbound(&self, data: &[u8]) {
        self.state.borrow_mut().inbound.extend(data.iter().copied());
    }

    pub fn close_inbound(&self) {
        self.state.borrow_mut().inbound_closed = true;
    }

    pub fn inbound_len(&self) -> usize {
        self.state.borrow().inbound.len()
    }

    pub fn grant(&self, bytes: usize) {
        let mut state = self.state.borrow_mut();
        state.write_budget = state.write_budget.saturating_add(bytes);
    }

    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().read_error = Some(kind);
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn shutdowns(&self) -> Vec<Shutdown> {
        self.state.borrow().shutdowns.clone()
    }
}

impl Read for FakeConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.read_error {
            return Err(kind.into());
        }
        if state.inbound.is_empty() {
            return if state.inbound_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for FakeConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if state.write_budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.write_budget);
        state.write_budget -= n;
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for FakeConn {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.state.borrow_mut().shutdowns.push(how);
        Ok(())
    }
}
