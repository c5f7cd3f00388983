//! Per-connection SMTP state machine.
//!
//! A [`Session`] consumes complete lines and produces at most one reply per
//! line. While a message body is being received, lines are accumulated
//! verbatim until the lone-dot terminator; otherwise each line is parsed
//! into a command and dispatched on the current state.

use crate::mailbox::{DeliverySink, Envelope};
use crate::protocols::smtp::parser::{self, Command, CommandKind};
use crate::protocols::smtp::response::Reply;
use crate::recipients::RecipientPolicy;
use indexmap::IndexSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Identity used when `HELO` carries no argument.
pub const DEFAULT_CLIENT_IDENTITY: &str = "localhost";

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Greeting sent, waiting for `HELO`.
    Connected,
    /// Waiting for `MAIL FROM:`.
    AwaitingSender,
    /// Sender known, collecting `RCPT TO:` until `DATA`.
    AwaitingRecipient,
    /// Between `DATA` and the terminating `.` line.
    ReceivingBody,
    /// `QUIT` received or a fatal fault; no more input is processed.
    Terminating,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Connected => "connected",
            State::AwaitingSender => "awaiting-sender",
            State::AwaitingRecipient => "awaiting-recipient",
            State::ReceivingBody => "receiving-body",
            State::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

/// Process-wide collaborators shared read-only by every session.
#[derive(Clone)]
pub struct Services {
    pub recipients: Arc<dyn RecipientPolicy>,
    pub mailbox: Arc<dyn DeliverySink>,
    /// Name the server announces in greetings and sign-offs.
    pub hostname: String,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// One SMTP session.
#[derive(Debug)]
pub struct Session {
    state: State,
    client_identity: Option<String>,
    sender: Option<String>,
    recipients: IndexSet<String>,
    body: String,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: State::Connected,
            client_identity: None,
            sender: None,
            recipients: IndexSet::new(),
            body: String::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminating(&self) -> bool {
        self.state == State::Terminating
    }

    pub fn client_identity(&self) -> Option<&str> {
        self.client_identity.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    /// Handle one complete line (terminator already stripped).
    pub fn handle_line(&mut self, line: &str, services: &Services) -> Option<Reply> {
        match self.state {
            State::Terminating => None,
            State::ReceivingBody => self.handle_body_line(line, services),
            _ => match parser::parse(line) {
                Ok(command) => {
                    let kind = command.kind;
                    let reply = self.handle_command(command, services);
                    if reply.code.is_error() {
                        debug!(?kind, code = reply.code.as_u16(), state = %self.state, "Command rejected");
                    }
                    Some(reply)
                }
                Err(e) => {
                    debug!(error = %e, "Rejecting line");
                    Some(Reply::unrecognized())
                }
            },
        }
    }

    fn handle_body_line(&mut self, line: &str, services: &Services) -> Option<Reply> {
        if line.trim() != "." {
            self.body.push_str(line);
            self.body.push('\n');
            return None;
        }

        trace!(bytes = self.body.len(), "End of message body");
        let envelope = Envelope {
            client: self
                .client_identity
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_IDENTITY.to_string()),
            sender: self.sender.clone().unwrap_or_default(),
            recipients: self.recipients.iter().cloned().collect(),
            body: std::mem::take(&mut self.body),
        };

        let reply = match services.mailbox.deliver(&envelope) {
            Ok(()) => {
                info!(
                    client = %envelope.client,
                    sender = %envelope.sender,
                    recipients = envelope.recipients.len(),
                    bytes = envelope.body.len(),
                    "Message delivered"
                );
                Reply::queued()
            }
            Err(e) => {
                error!(
                    sender = %envelope.sender,
                    recipients = envelope.recipients.len(),
                    error = %e,
                    "Delivery failed"
                );
                Reply::local_error()
            }
        };

        self.reset_transaction();
        self.set_state(State::AwaitingSender);
        Some(reply)
    }

    fn handle_command(&mut self, command: Command, services: &Services) -> Reply {
        trace!(state = %self.state, command = ?command.kind, arg = command.arg(), "Command");

        match (self.state, command.kind) {
            (State::ReceivingBody | State::Terminating, kind) => {
                // Body lines and post-QUIT input never reach the command parser.
                error!(state = %self.state, ?kind, "Invariant violation: command in unmapped state");
                self.set_state(State::Terminating);
                Reply::internal_error()
            }

            (_, CommandKind::Quit) => {
                self.set_state(State::Terminating);
                Reply::closing(&services.hostname)
            }
            (_, CommandKind::Help) => Reply::help(command.argument.as_deref()),

            (State::Connected, CommandKind::Helo) => {
                let identity = match command.arg() {
                    "" => DEFAULT_CLIENT_IDENTITY.to_string(),
                    arg => arg.to_string(),
                };
                let reply = Reply::hello(&identity);
                self.client_identity = Some(identity);
                self.set_state(State::AwaitingSender);
                reply
            }

            (State::AwaitingSender, CommandKind::MailFrom) => {
                let sender = command.arg();
                if sender.trim().is_empty() {
                    return Reply::bad_arguments();
                }
                self.reset_transaction();
                self.sender = Some(sender.to_string());
                self.set_state(State::AwaitingRecipient);
                Reply::ok()
            }

            (State::AwaitingRecipient, CommandKind::RcptTo) => {
                self.add_recipient(command.arg(), services)
            }

            (State::AwaitingRecipient, CommandKind::Data) => {
                if self.recipients.is_empty() {
                    return Reply::no_recipients();
                }
                self.body.clear();
                self.set_state(State::ReceivingBody);
                Reply::start_mail_input()
            }

            (State::Connected | State::AwaitingSender | State::AwaitingRecipient, _) => {
                Reply::bad_sequence()
            }
        }
    }

    fn add_recipient(&mut self, recipient: &str, services: &Services) -> Reply {
        if recipient.trim().is_empty() {
            return Reply::bad_arguments();
        }
        if !services.recipients.is_authorized(recipient) {
            debug!(recipient, "Unknown recipient");
            return Reply::unknown_recipient();
        }
        if !self.recipients.insert(recipient.to_string()) {
            debug!(recipient, "Duplicate recipient");
            return Reply::duplicate_recipient();
        }
        Reply::ok()
    }

    fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state changed");
            self.state = state;
        }
    }
}
