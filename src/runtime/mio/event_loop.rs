//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! dispatcher performs non-blocking read/write syscalls. One thread, one
//! `Poll`, one listener; every connection is an entry in the dispatcher's
//! registry keyed by its mio token.

use crate::protocols::smtp::Services;
use crate::runtime::dispatch::{Dispatcher, Event, Outcome};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Number of readiness events handled per poll.
const EVENT_BATCH: usize = 1024;

/// Tunables for the event loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_connections: usize,
    /// Read buffer capacity per connection.
    pub buffer_size: usize,
    /// Evict connections without input for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

/// Create a non-blocking listener with `SO_REUSEADDR`.
pub fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Run the event loop on `listener` until a poll error occurs.
pub fn serve(
    listener: std::net::TcpListener,
    options: &LoopOptions,
    services: Services,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_BATCH);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut dispatcher: Dispatcher<TcpStream> =
        Dispatcher::new(services, options.max_connections, options.buffer_size);

    info!(
        addr = %listener.local_addr()?,
        max_connections = options.max_connections,
        buffer_size = options.buffer_size,
        idle_timeout = ?options.idle_timeout,
        "Event loop started"
    );

    loop {
        // Connections that yielded their read budget still have input.
        let timeout = if dispatcher.has_ready() {
            Some(Duration::ZERO)
        } else {
            options.idle_timeout
        };
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_connections(&listener, &poll, &mut dispatcher),
                Token(conn_id) => {
                    let event = if event.is_readable() || event.is_read_closed() || event.is_error() {
                        Event::Readable(conn_id)
                    } else {
                        Event::Writable(conn_id)
                    };
                    let outcome = dispatcher.dispatch(event);
                    apply_outcome(&poll, &mut dispatcher, conn_id, outcome);
                }
            }
        }

        for conn_id in dispatcher.take_ready() {
            let outcome = dispatcher.dispatch(Event::Readable(conn_id));
            apply_outcome(&poll, &mut dispatcher, conn_id, outcome);
        }

        if let Some(timeout) = options.idle_timeout {
            for (conn_id, outcome) in dispatcher.evict_idle(Instant::now(), timeout) {
                apply_outcome(&poll, &mut dispatcher, conn_id, outcome);
            }
        }
    }
}

fn accept_connections(listener: &TcpListener, poll: &Poll, dispatcher: &mut Dispatcher<TcpStream>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let outcome = dispatcher.dispatch(Event::Accepted { stream, peer });
                if let Outcome::Opened { id, writable } = outcome {
                    let registered = dispatcher.get_mut(id).map(|conn| {
                        poll.registry()
                            .register(&mut conn.stream, Token(id), interest(writable))
                    });
                    if let Some(Err(e)) = registered {
                        error!(conn_id = id, peer = %peer, error = %e, "Failed to register connection");
                        dispatcher.remove(id);
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn apply_outcome(poll: &Poll, dispatcher: &mut Dispatcher<TcpStream>, conn_id: usize, outcome: Outcome) {
    match outcome {
        Outcome::Unchanged | Outcome::Opened { .. } | Outcome::Refused => {}
        Outcome::Reregister { writable } => {
            let result = dispatcher.get_mut(conn_id).map(|conn| {
                poll.registry()
                    .reregister(&mut conn.stream, Token(conn_id), interest(writable))
            });
            if let Some(Err(e)) = result {
                debug!(conn_id, error = %e, "Failed to reregister connection");
                close_connection(poll, dispatcher, conn_id);
            }
        }
        Outcome::Close => close_connection(poll, dispatcher, conn_id),
    }
}

fn close_connection(poll: &Poll, dispatcher: &mut Dispatcher<TcpStream>, conn_id: usize) {
    if let Some(mut conn) = dispatcher.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
    }
}

fn interest(writable: bool) -> Interest {
    if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::smtp::session::tests::{services_with, RecordingSink};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::Arc;
    use std::thread;

    fn start_server(options: LoopOptions) -> (SocketAddr, Arc<RecordingSink>) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let services = services_with(sink.clone());

        thread::spawn(move || {
            let _ = serve(listener, &options, services);
        });
        (addr, sink)
    }

    fn options() -> LoopOptions {
        LoopOptions {
            max_connections: 16,
            buffer_size: 1024,
            idle_timeout: None,
        }
    }

    struct Client {
        reader: BufReader<StdTcpStream>,
        writer: StdTcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdTcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let writer = stream.try_clone().unwrap();
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).unwrap();
            self.writer.flush().unwrap();
        }

        fn reply(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line
        }

        fn code(&mut self) -> String {
            let line = self.reply();
            assert!(line.ends_with("\r\n"), "unterminated reply {line:?}");
            line[..3].to_string()
        }

        /// True once the server has closed its side.
        fn at_eof(&mut self) -> bool {
            let mut line = String::new();
            matches!(self.reader.read_line(&mut line), Ok(0))
        }
    }

    #[test]
    fn test_loopback_session() {
        let (addr, sink) = start_server(options());
        let mut client = Client::connect(addr);

        assert_eq!(client.code(), "220");

        client.send(b"HELO client\r\n");
        assert_eq!(client.code(), "250");

        // Command split across two writes.
        client.send(b"MAIL FR");
        thread::sleep(Duration::from_millis(20));
        client.send(b"OM:<a@b>\r\n");
        assert_eq!(client.code(), "250");

        client.send(b"RCPT TO:<validuser@example>\r\nDATA\r\n");
        assert_eq!(client.code(), "250");
        assert_eq!(client.code(), "354");

        client.send(b"hello\r\n.\r\nQUIT\r\n");
        assert_eq!(client.code(), "250");
        assert_eq!(client.code(), "221");
        assert!(client.at_eof());

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].client, "client");
        assert_eq!(delivered[0].body, "hello\n");
    }

    #[test]
    fn test_concurrent_clients() {
        let (addr, _sink) = start_server(options());
        let mut first = Client::connect(addr);
        let mut second = Client::connect(addr);
        assert_eq!(first.code(), "220");
        assert_eq!(second.code(), "220");

        first.send(b"HELO one\r\n");
        second.send(b"MAIL FROM:<x@y>\r\n");
        assert_eq!(second.code(), "503");
        assert_eq!(first.code(), "250");

        second.send(b"QUIT\r\n");
        assert_eq!(second.code(), "221");
        assert!(second.at_eof());

        // The first client is unaffected by the second one leaving.
        first.send(b"HELP QUIT\r\n");
        assert_eq!(first.code(), "214");
    }

    #[test]
    fn test_pipelined_burst_is_fully_answered() {
        let (addr, _sink) = start_server(options());
        let mut client = Client::connect(addr);
        assert_eq!(client.code(), "220");

        // Far more lines than one read budget covers; every one is answered.
        let burst = "HELP\r\n".repeat(200);
        client.send(burst.as_bytes());
        for _ in 0..200 {
            assert_eq!(client.code(), "214");
        }

        client.send(b"QUIT\r\n");
        assert_eq!(client.code(), "221");
    }

    #[test]
    fn test_idle_connection_is_evicted() {
        let (addr, _sink) = start_server(LoopOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            ..options()
        });
        let mut client = Client::connect(addr);
        assert_eq!(client.code(), "220");

        assert_eq!(client.code(), "421");
        assert!(client.at_eof());
    }
}
