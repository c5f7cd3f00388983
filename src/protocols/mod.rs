//! Protocol implementations.
//!
//! Protocols are plain state machines over complete lines; the runtime
//! owns sockets and framing.
//!
//! - `smtp`: SMTP mail submission (HELO, MAIL FROM, RCPT TO, DATA, HELP, QUIT)

pub mod smtp;
