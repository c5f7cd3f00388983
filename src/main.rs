//! submitd: a small SMTP mail submission server
//!
//! Accepts mail over a subset of SMTP:
//! - HELO, MAIL FROM, RCPT TO, DATA, HELP and QUIT
//! - Recipients checked against a configured allow-list
//! - One file per message and recipient below a mailbox directory
//! - Single-threaded readiness loop (epoll on Linux, kqueue on macOS)
//! - Configuration via CLI arguments or TOML file

mod config;
mod mailbox;
mod protocols;
mod recipients;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        hostname = %config.hostname,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        idle_timeout = config.idle_timeout,
        "Starting submitd"
    );

    runtime::run(config)?;
    Ok(())
}
