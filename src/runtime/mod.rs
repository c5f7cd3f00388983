//! Single-threaded readiness runtime.
//!
//! - `buffer`: per-connection read buffer and CRLF line framing
//! - `connection`: connection state and the slab-backed registry
//! - `dispatch`: socket-independent event handling
//! - `mio`: the poll loop (epoll on Linux, kqueue on macOS)

pub mod buffer;
pub mod connection;
pub mod dispatch;
pub mod mio;

use self::mio::LoopOptions;
use crate::config::Config;
use crate::mailbox::FileMailbox;
use crate::protocols::smtp::Services;
use crate::recipients::StaticRecipients;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Run the server with settings from `config`.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let recipients = StaticRecipients::new(config.recipients.iter().cloned());
    if recipients.is_empty() {
        warn!("No recipients configured; every RCPT TO will be rejected");
    }
    let mailbox = FileMailbox::new(&config.mailbox_dir, config.hostname.clone());
    info!(
        recipients = recipients.len(),
        mailbox_dir = %mailbox.base_dir().display(),
        "Delivery configured"
    );

    let services = Services {
        recipients: Arc::new(recipients),
        mailbox: Arc::new(mailbox),
        hostname: config.hostname.clone(),
    };

    let options = LoopOptions {
        max_connections: config.max_connections,
        buffer_size: config.buffer_size,
        idle_timeout: (config.idle_timeout > 0).then(|| Duration::from_secs(config.idle_timeout)),
    };

    let listener = self::mio::bind(addr)?;
    self::mio::serve(listener, &options, services)
}
