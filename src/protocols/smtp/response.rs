//! SMTP replies.
//!
//! Every reply is a single line: three-digit code, a space, free text and
//! CRLF.

use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use std::fmt;

/// Reply codes used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    HelpMessage = 214,
    ServiceReady = 220,
    Closing = 221,
    Ok = 250,
    StartMailInput = 354,
    ServiceUnavailable = 421,
    LocalError = 451,
    SyntaxError = 500,
    ParameterError = 501,
    NotImplemented = 502,
    BadSequence = 503,
    MailboxUnavailable = 550,
    TransactionFailed = 554,
}

impl Code {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// 4xx and 5xx codes.
    pub fn is_error(self) -> bool {
        self.as_u16() >= 400
    }
}

/// A reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub text: Cow<'static, str>,
}

impl Reply {
    pub fn new(code: Code, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(Code::ServiceReady, format!("{hostname} Service ready"))
    }

    pub fn closing(hostname: &str) -> Self {
        Self::new(Code::Closing, format!("{hostname} Bye"))
    }

    pub fn hello(identity: &str) -> Self {
        Self::new(Code::Ok, format!("Hello {identity}"))
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "Ok")
    }

    pub fn queued() -> Self {
        Self::new(Code::Ok, "Ok: message queued")
    }

    pub fn start_mail_input() -> Self {
        Self::new(
            Code::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        )
    }

    pub fn idle_timeout(hostname: &str) -> Self {
        Self::new(
            Code::ServiceUnavailable,
            format!("{hostname} Idle timeout, closing connection"),
        )
    }

    pub fn local_error() -> Self {
        Self::new(
            Code::LocalError,
            "Requested action aborted: local error in processing",
        )
    }

    pub fn unrecognized() -> Self {
        Self::new(Code::SyntaxError, "Syntax error, command unrecognized")
    }

    pub fn line_too_long() -> Self {
        Self::new(Code::SyntaxError, "Line too long")
    }

    pub fn internal_error() -> Self {
        Self::new(Code::SyntaxError, "Internal server error")
    }

    pub fn bad_arguments() -> Self {
        Self::new(
            Code::ParameterError,
            "Syntax error in parameters or arguments",
        )
    }

    pub fn not_implemented() -> Self {
        Self::new(Code::NotImplemented, "Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Self::new(Code::BadSequence, "Bad sequence of commands")
    }

    pub fn unknown_recipient() -> Self {
        Self::new(
            Code::MailboxUnavailable,
            "Recipient not found: unknown recipient",
        )
    }

    pub fn duplicate_recipient() -> Self {
        Self::new(Code::MailboxUnavailable, "Duplicate recipient not allowed")
    }

    pub fn no_recipients() -> Self {
        Self::new(Code::TransactionFailed, "No valid recipients")
    }

    /// Help text: the command list, or a topic description.
    ///
    /// Unknown topics get `502`.
    pub fn help(topic: Option<&str>) -> Self {
        let Some(topic) = topic else {
            return Self::new(
                Code::HelpMessage,
                "Supported commands: HELO, MAIL FROM, RCPT TO, DATA, HELP, QUIT",
            );
        };

        let text = match topic.to_ascii_uppercase().as_str() {
            "HELO" => "HELO <hostname>: identify yourself to the server",
            "MAIL" | "MAIL FROM" => "MAIL FROM:<address>: specify sender",
            "RCPT" | "RCPT TO" => "RCPT TO:<address>: specify recipient",
            "DATA" => "DATA: send message body, end with <CRLF>.<CRLF>",
            "QUIT" => "QUIT: terminate the session",
            "HELP" => "HELP [command]: describe a command",
            _ => return Self::not_implemented(),
        };
        Self::new(Code::HelpMessage, text)
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let code = self.code.as_u16();
        out.reserve(self.text.len() + 6);
        // Codes are always three digits.
        out.put_u8(b'0' + (code / 100) as u8);
        out.put_u8(b'0' + (code / 10 % 10) as u8);
        out.put_u8(b'0' + (code % 10) as u8);
        out.put_u8(b' ');
        out.put_slice(self.text.as_bytes());
        out.put_slice(b"\r\n");
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code.as_u16(), self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut out = BytesMut::new();
        Reply::ok().encode(&mut out);
        Reply::greeting("mx.example").encode(&mut out);
        assert_eq!(&out[..], b"250 Ok\r\n220 mx.example Service ready\r\n");
    }

    #[test]
    fn test_display_has_no_terminator() {
        assert_eq!(Reply::bad_sequence().to_string(), "503 Bad sequence of commands");
    }

    #[test]
    fn test_help_topics() {
        assert_eq!(Reply::help(None).code, Code::HelpMessage);
        assert!(Reply::help(None).text.contains("RCPT TO"));
        assert_eq!(Reply::help(Some("mail")).code, Code::HelpMessage);
        assert_eq!(Reply::help(Some("RCPT TO")).code, Code::HelpMessage);
        assert_eq!(Reply::help(Some("NOOP")).code, Code::NotImplemented);
    }

    #[test]
    fn test_error_classes() {
        assert!(Reply::local_error().code.is_error());
        assert!(Reply::no_recipients().code.is_error());
        assert!(!Reply::start_mail_input().code.is_error());
    }
}
