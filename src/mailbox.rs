//! Message delivery.
//!
//! Completed transactions are handed to a [`DeliverySink`]. The shipped
//! [`FileMailbox`] stores one independent copy per recipient:
//! - One directory per recipient below the mailbox root
//! - One file per message, named `<sender>_<id>` with a random numeric id
//! - A `Received:` timestamp line naming the submitting client

use chrono::Local;
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Upper bound (exclusive) for generated message ids.
const MESSAGE_ID_RANGE: u32 = 10_000;

/// How many fresh ids to try before giving up on a crowded mailbox.
const MAX_ID_ATTEMPTS: usize = 16;

/// A fully assembled message and its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Identity the client gave in `HELO`.
    pub client: String,
    pub sender: String,
    /// Recipients in declaration order.
    pub recipients: Vec<String>,
    pub body: String,
}

/// Delivery failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("envelope has no recipients")]
    NoRecipients,

    #[error("no free message id in {}", .0.display())]
    IdsExhausted(PathBuf),

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Durable storage for completed messages.
pub trait DeliverySink: Send + Sync {
    /// Store `envelope` for every recipient. Called once per transaction.
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// File-backed mailbox rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FileMailbox {
    base_dir: PathBuf,
    hostname: String,
}

impl FileMailbox {
    pub fn new(base_dir: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            hostname: hostname.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write the copy for one recipient, creating its directory on first use.
    fn store_for(&self, recipient: &str, sender: &str, contents: &[u8]) -> Result<PathBuf, DeliveryError> {
        let dir = self.base_dir.join(sanitize(recipient));
        fs::create_dir_all(&dir).map_err(|source| DeliveryError::Io {
            path: dir.clone(),
            source,
        })?;
        self.store_copy(&dir, sender, contents)
    }

    /// Write one copy into `dir`, picking an unused message id.
    fn store_copy(&self, dir: &Path, sender: &str, contents: &[u8]) -> Result<PathBuf, DeliveryError> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = rng.gen_range(0..MESSAGE_ID_RANGE);
            let path = dir.join(message_file_name(sender, id));

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!(path = %path.display(), "Message id taken, retrying");
                    continue;
                }
                Err(source) => return Err(DeliveryError::Io { path, source }),
            };

            file.write_all(contents)
                .and_then(|_| file.sync_all())
                .map_err(|source| DeliveryError::Io {
                    path: path.clone(),
                    source,
                })?;

            return Ok(path);
        }

        Err(DeliveryError::IdsExhausted(dir.to_path_buf()))
    }
}

impl DeliverySink for FileMailbox {
    /// Store one copy per recipient. Delivery is all or nothing: if any copy
    /// fails, the copies already written are removed again.
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        if envelope.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }

        let mut message = received_line(&envelope.client, &self.hostname);
        message.push_str(&envelope.body);

        let mut stored = Vec::with_capacity(envelope.recipients.len());
        for recipient in &envelope.recipients {
            match self.store_for(recipient, &envelope.sender, message.as_bytes()) {
                Ok(path) => {
                    debug!(recipient = %recipient, path = %path.display(), "Stored message");
                    stored.push(path);
                }
                Err(e) => {
                    discard(&stored);
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Remove copies written before a failed delivery.
fn discard(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed partial delivery"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial delivery"),
        }
    }
}

/// Timestamp line prepended to every stored copy.
///
/// The zone is written as a numeric UTC offset (`+0200`); local zone
/// abbreviations are not available portably.
pub fn received_line(client: &str, hostname: &str) -> String {
    let now = Local::now();
    format!(
        "Received: FROM {client} BY {hostname} ; {}\n",
        now.format("%d %b %y %H:%M:%S %z")
    )
}

/// File name for a stored copy.
fn message_file_name(sender: &str, id: u32) -> String {
    format!("{}_{id}", sanitize(sender))
}

/// Replace anything outside `[A-Za-z0-9@._-]` with `_`.
///
/// Leading dots are replaced as well so an address can never name `.` or `..`.
fn sanitize(address: &str) -> String {
    let mut out: String = address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let leading_dots = out.len() - out.trim_start_matches('.').len();
    if leading_dots > 0 {
        out.replace_range(..leading_dots, &"_".repeat(leading_dots));
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
