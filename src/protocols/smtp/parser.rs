//! SMTP command parser.
//!
//! Turns one line of text (terminator already stripped) into a typed
//! [`Command`]. Keywords are matched case-insensitively by prefix against
//! [`KEYWORDS`], in table order.

use thiserror::Error;

/// Command keywords understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `HELO <host>`
    Helo,
    /// `MAIL FROM:<address>`
    MailFrom,
    /// `RCPT TO:<address>`
    RcptTo,
    /// `DATA`
    Data,
    /// `QUIT`
    Quit,
    /// `HELP [topic]`
    Help,
}

/// Keyword table, matched in order. First prefix match wins, so a keyword
/// that is a prefix of another must come after it.
pub const KEYWORDS: &[(&str, CommandKind)] = &[
    ("HELO", CommandKind::Helo),
    ("MAIL FROM:", CommandKind::MailFrom),
    ("RCPT TO:", CommandKind::RcptTo),
    ("DATA", CommandKind::Data),
    ("QUIT", CommandKind::Quit),
    ("HELP", CommandKind::Help),
];

/// Parsed command with its (optional) argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub argument: Option<String>,
}

impl Command {
    pub fn new(kind: CommandKind, argument: Option<String>) -> Self {
        Self { kind, argument }
    }

    /// Argument as a string slice, empty when absent.
    pub fn arg(&self) -> &str {
        self.argument.as_deref().unwrap_or("")
    }
}

/// Parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unrecognized command: {0:?}")]
    UnrecognizedCommand(String),
}

/// Parse a single command line.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let trimmed = line.trim();

    let (keyword, kind) = KEYWORDS
        .iter()
        .copied()
        .find(|(keyword, _)| starts_with_ignore_case(trimmed, keyword))
        .ok_or_else(|| ParseError::UnrecognizedCommand(line.to_string()))?;

    // Keywords are ASCII, so the byte offset is a char boundary whenever the
    // prefix matched.
    let rest = &trimmed[keyword.len()..];

    let argument = match kind {
        CommandKind::Helo => Some(skip_separator(rest).trim().to_string()),
        CommandKind::MailFrom | CommandKind::RcptTo => Some(extract_address(rest)),
        CommandKind::Data | CommandKind::Quit => None,
        CommandKind::Help => {
            let topic = rest.trim();
            (!topic.is_empty()).then(|| topic.to_string())
        }
    };

    Ok(Command::new(kind, argument))
}

fn starts_with_ignore_case(line: &str, keyword: &str) -> bool {
    line.len() >= keyword.len()
        && line.as_bytes()[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

/// Drop a single separator character following the keyword.
fn skip_separator(rest: &str) -> &str {
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_whitespace() => chars.as_str(),
        _ => rest,
    }
}

/// Strip one pair of surrounding angle brackets, if both are present.
fn extract_address(rest: &str) -> String {
    let address = rest.trim();
    address
        .strip_prefix('<')
        .and_then(|inner| inner.strip_suffix('>'))
        .unwrap_or(address)
        .trim()
        .to_string()
}
