//! SMTP submission protocol (command subset).
//!
//! A line-oriented protocol: every command and reply is one CRLF-terminated
//! ASCII line, and a message body is a run of lines ended by a lone `.`.
//!
//! ## Protocol Format
//!
//! ```text
//! S: 220 mx.example Service ready
//! C: HELO client.example
//! S: 250 Hello client.example
//! C: MAIL FROM:<alice@client.example>
//! S: 250 Ok
//! C: RCPT TO:<abc@def.edu>
//! S: 250 Ok
//! C: DATA
//! S: 354 Start mail input; end with <CRLF>.<CRLF>
//! C: hello
//! C: .
//! S: 250 Ok: message queued
//! C: QUIT
//! S: 221 mx.example Bye
//! ```

pub mod parser;
pub mod response;
pub mod session;

pub use response::Reply;
pub use session::{Services, Session};
