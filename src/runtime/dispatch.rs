//! Socket-independent connection dispatcher.
//!
//! The event loop translates readiness notifications into [`Event`]s and
//! feeds them to a [`Dispatcher`]. The dispatcher owns the connection
//! registry and does all per-connection work: greeting, reading, framing,
//! running the session, queuing and flushing replies. It never blocks and
//! works with any `Read + Write` stream, so it can be driven with in-memory
//! streams as well as mio sockets.

use crate::protocols::smtp::{Reply, Services};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Readiness event for the dispatcher.
#[derive(Debug)]
pub enum Event<S> {
    /// A new stream was accepted.
    Accepted { stream: S, peer: SocketAddr },
    /// The connection has data (or EOF) to read.
    Readable(usize),
    /// The connection can take more output.
    Writable(usize),
}

/// What the event loop has to do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// New connection stored under `id`; register it with the poller.
    Opened { id: usize, writable: bool },
    /// The accepted stream was dropped.
    Refused,
    /// Nothing changed for the poller.
    Unchanged,
    /// Switch write interest on or off.
    Reregister { writable: bool },
    /// Tear the connection down.
    Close,
}

/// Reads a connection may do per event before yielding to the others.
pub const READ_BUDGET: usize = 16;

/// Result of one read attempt.
enum ReadStatus {
    /// Bytes were read and processed, or the read was interrupted.
    Progress,
    WouldBlock,
    Eof,
}

/// Where servicing a connection stopped.
enum Step {
    /// Waiting for the socket: readable or writable again.
    Parked,
    /// Read budget used up with input possibly left in the socket.
    Yielded,
    Close,
}

/// Owns every connection and services its events.
pub struct Dispatcher<S> {
    registry: ConnectionRegistry<S>,
    services: Services,
    buffer_size: usize,
    /// Connections that yielded and must be serviced again without waiting
    /// for a new readiness event.
    ready: Vec<usize>,
}

impl<S: Read + Write> Dispatcher<S> {
    pub fn new(services: Services, max_connections: usize, buffer_size: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(max_connections),
            services,
            buffer_size,
            ready: Vec::new(),
        }
    }

    /// Handle one event.
    pub fn dispatch(&mut self, event: Event<S>) -> Outcome {
        match event {
            Event::Accepted { stream, peer } => self.open(stream, peer),
            Event::Readable(id) | Event::Writable(id) => self.service(id),
        }
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.registry.get_mut(id)
    }

    /// Remove a connection, handing it back so the caller can deregister the
    /// stream before it is dropped.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        let conn = self.registry.remove(id)?;
        debug!(
            conn_id = id,
            peer = %conn.peer,
            state = %conn.session.state(),
            client = conn.session.client_identity(),
            sender = conn.session.sender(),
            recipients = conn.session.recipient_count(),
            active = self.len(),
            "Connection closed"
        );
        Some(conn)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// True when some connection yielded and is waiting for another turn.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Take the connections that yielded. Feed each back as `Readable`.
    pub fn take_ready(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.ready)
    }

    /// Handle connections idle for at least `timeout`.
    ///
    /// Each one gets `421` and goes through the normal drain-then-close path;
    /// the returned outcomes tell the caller what to do with the poller. A
    /// connection that is still closing after another full timeout is
    /// dropped without waiting any longer.
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> Vec<(usize, Outcome)> {
        let idle: Vec<usize> = self
            .registry
            .iter()
            .filter(|(_, conn)| conn.idle_for(now) >= timeout)
            .map(|(id, _)| id)
            .collect();

        let mut outcomes = Vec::with_capacity(idle.len());
        for id in idle {
            let Some(conn) = self.registry.get_mut(id) else {
                continue;
            };

            if conn.is_closing() {
                debug!(
                    conn_id = id,
                    peer = %conn.peer,
                    pending = conn.outbound.len(),
                    "Dropping connection that never drained"
                );
                outcomes.push((id, Outcome::Close));
                continue;
            }

            debug!(conn_id = id, peer = %conn.peer, "Evicting idle connection");
            conn.queue(&Reply::idle_timeout(&self.services.hostname));
            conn.close();
            conn.touch(now);

            let outcome = match conn.flush() {
                Err(e) => {
                    debug!(conn_id = id, peer = %conn.peer, error = %e, "Failed to send idle notice");
                    Outcome::Close
                }
                Ok(()) if !conn.has_pending_output() => Outcome::Close,
                Ok(()) if conn.write_interest => Outcome::Unchanged,
                Ok(()) => {
                    conn.write_interest = true;
                    Outcome::Reregister { writable: true }
                }
            };
            outcomes.push((id, outcome));
        }
        outcomes
    }

    fn open(&mut self, stream: S, peer: SocketAddr) -> Outcome {
        let conn = Connection::new(stream, peer, self.buffer_size);
        let id = match self.registry.insert(conn) {
            Ok(id) => id,
            Err(_) => {
                warn!(peer = %peer, max = self.registry.capacity(), "Connection limit reached");
                return Outcome::Refused;
            }
        };

        let Some(conn) = self.registry.get_mut(id) else {
            return Outcome::Refused;
        };
        conn.queue(&Reply::greeting(&self.services.hostname));

        if let Err(e) = conn.flush() {
            debug!(conn_id = id, peer = %peer, error = %e, "Failed to send greeting");
            self.registry.remove(id);
            return Outcome::Refused;
        }

        conn.write_interest = conn.has_pending_output();
        let writable = conn.write_interest;
        debug!(conn_id = id, peer = %peer, active = self.len(), "Accepted connection");
        Outcome::Opened { id, writable }
    }

    /// Flush, then read and process input until the socket would block,
    /// output backs up, the read budget runs out, or the connection is done.
    fn service(&mut self, id: usize) -> Outcome {
        let Some(conn) = self.registry.get_mut(id) else {
            // Stale event for a connection closed earlier in this batch.
            return Outcome::Unchanged;
        };

        match drive(id, conn, &self.services) {
            Ok(Step::Parked) => {}
            Ok(Step::Yielded) => {
                if !self.ready.contains(&id) {
                    self.ready.push(id);
                }
            }
            Ok(Step::Close) => return Outcome::Close,
            Err(e) => {
                debug!(conn_id = id, peer = %conn.peer, error = %e, "Connection error");
                return Outcome::Close;
            }
        }

        let writable = conn.has_pending_output();
        if writable == conn.write_interest {
            Outcome::Unchanged
        } else {
            conn.write_interest = writable;
            Outcome::Reregister { writable }
        }
    }
}

/// Service one connection for at most [`READ_BUDGET`] reads.
fn drive<S: Read + Write>(
    id: usize,
    conn: &mut Connection<S>,
    services: &Services,
) -> io::Result<Step> {
    let mut reads = 0;
    loop {
        conn.flush()?;

        match conn.state {
            ConnState::Closing if !conn.has_pending_output() => return Ok(Step::Close),
            ConnState::Closing | ConnState::Writing => return Ok(Step::Parked),
            ConnState::Reading => {}
        }

        if reads == READ_BUDGET {
            return Ok(Step::Yielded);
        }
        reads += 1;

        match read_input(id, conn, services)? {
            ReadStatus::Progress => {}
            ReadStatus::WouldBlock => return Ok(Step::Parked),
            ReadStatus::Eof => {
                if !conn.read_buf.is_empty() {
                    debug!(
                        conn_id = id,
                        buffered = conn.read_buf.len(),
                        "Peer closed with an unterminated line"
                    );
                }
                debug!(conn_id = id, peer = %conn.peer, "Connection closed by peer");
                return Ok(Step::Close);
            }
        }
    }
}

/// Read once and run every complete line through the session.
fn read_input<S: Read>(
    id: usize,
    conn: &mut Connection<S>,
    services: &Services,
) -> io::Result<ReadStatus> {
    if conn.read_buf.is_full() {
        warn!(
            conn_id = id,
            peer = %conn.peer,
            capacity = conn.read_buf.capacity(),
            "Unterminated line exceeds read buffer"
        );
        conn.queue(&Reply::line_too_long());
        conn.close();
        return Ok(ReadStatus::Progress);
    }

    let n = match conn.fill() {
        Ok(0) => return Ok(ReadStatus::Eof),
        Ok(n) => n,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ReadStatus::Progress),
        Err(e) => return Err(e),
    };
    trace!(conn_id = id, bytes = n, buffered = conn.read_buf.len(), "Read");
    conn.touch(Instant::now());

    let mut replies = Vec::new();
    for line in conn.read_buf.lines() {
        trace!(conn_id = id, line = %line, "Line");
        replies.extend(conn.session.handle_line(&line, services));
        if conn.session.is_terminating() {
            break;
        }
    }

    for reply in &replies {
        trace!(conn_id = id, reply = %reply, "Reply");
        conn.queue(reply);
    }
    if conn.session.is_terminating() {
        conn.close();
    }

    Ok(ReadStatus::Progress)
}
