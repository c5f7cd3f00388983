//! Connection state and the connection registry.
//!
//! Each connection owns its stream, its SMTP session, its read buffer and
//! the queue of replies not yet written. All of it lives in one registry
//! entry, created on accept and dropped on close.

use crate::protocols::smtp::{Reply, Session};
use crate::runtime::buffer::ReadBuffer;
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// I/O state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nothing queued; waiting for input.
    Reading,
    /// Replies queued that the socket has not taken yet. Input is not read
    /// until they drain.
    Writing,
    /// Close once the queued replies are written. No more input is read.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub session: Session,
    pub read_buf: ReadBuffer,
    /// Encoded replies waiting to be written, in order.
    pub outbound: BytesMut,
    /// Last time input arrived; drives idle eviction.
    pub last_activity: Instant,
    /// Whether the poller currently watches this connection for writability.
    pub write_interest: bool,
}

impl<S> Connection<S> {
    /// Create a new connection with a fresh session.
    pub fn new(stream: S, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            session: Session::new(),
            read_buf: ReadBuffer::new(buffer_size),
            outbound: BytesMut::with_capacity(256),
            last_activity: Instant::now(),
            write_interest: false,
        }
    }

    /// Queue a reply for writing. Nothing is sent until [`flush`](Self::flush).
    pub fn queue(&mut self, reply: &Reply) {
        reply.encode(&mut self.outbound);
    }

    /// Stop reading and close once everything queued is written.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Record input activity.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time since the last input, relative to `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

impl<S: Read> Connection<S> {
    /// One read into the spare space of the read buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed.
    pub fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(self.read_buf.spare_mut())?;
        self.read_buf.commit(n);
        Ok(n)
    }
}

impl<S: Write> Connection<S> {
    /// Write queued replies until the socket would block or the queue is empty.
    ///
    /// Partial writes leave the remainder queued; the state becomes `Writing`
    /// until a later flush drains it.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.state = match (self.state, self.outbound.is_empty()) {
            (ConnState::Closing, _) => ConnState::Closing,
            (_, true) => ConnState::Reading,
            (_, false) => ConnState::Writing,
        };
        Ok(())
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The slab key is the
/// connection id handed to the poller as its token.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }
}
