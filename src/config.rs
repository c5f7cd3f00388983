//! Configuration module for the submission server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the submission server
#[derive(Parser, Debug)]
#[command(name = "submitd")]
#[command(version = "0.1.0")]
#[command(about = "A small SMTP mail submission server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8025)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-connection read buffer size in bytes; bounds the line length
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Host name used in greetings and Received lines
    #[arg(long)]
    pub hostname: Option<String>,

    /// Directory holding one mailbox directory per recipient
    #[arg(long)]
    pub mailbox_dir: Option<PathBuf>,

    /// Authorized recipient address (repeatable; replaces the configured list)
    #[arg(long = "recipient")]
    pub recipients: Vec<String>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Idle timeout in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            hostname: default_hostname(),
            idle_timeout: 0,
        }
    }
}

/// Delivery settings
#[derive(Debug, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_mailbox_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_recipients")]
    pub recipients: Vec<String>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            dir: default_mailbox_dir(),
            recipients: default_recipients(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8025".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_mailbox_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_recipients() -> Vec<String> {
    ["abc@def.edu", "ghi@jkl.com", "nmo@pqr.gov", "stu@vwx.de"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub hostname: String,
    pub mailbox_dir: PathBuf,
    pub recipients: Vec<String>,
    pub idle_timeout: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed arguments against the optional config file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            mailbox,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(server.buffer_size),
            hostname: cli.hostname.unwrap_or(server.hostname),
            mailbox_dir: cli.mailbox_dir.unwrap_or(mailbox.dir),
            recipients: if cli.recipients.is_empty() {
                mailbox.recipients
            } else {
                cli.recipients
            },
            idle_timeout: cli.idle_timeout.unwrap_or(server.idle_timeout),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        // A buffer must hold at least a CRLF to ever frame a line.
        if self.buffer_size < 2 {
            return Err(ConfigError::Invalid("buffer_size must be at least 2"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("submitd").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_args(cli(&[])).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8025");
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.mailbox_dir, PathBuf::from("data"));
        assert_eq!(
            config.recipients,
            vec!["abc@def.edu", "ghi@jkl.com", "nmo@pqr.gov", "stu@vwx.de"]
        );
        assert_eq!(config.idle_timeout, 0);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:2525"
            max_connections = 64
            hostname = "mx.example"
            idle_timeout = 300

            [mailbox]
            dir = "/var/spool/submitd"
            recipients = ["postmaster@example"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:2525");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.server.hostname, "mx.example");
        assert_eq!(config.server.idle_timeout, 300);
        assert_eq!(config.mailbox.dir, PathBuf::from("/var/spool/submitd"));
        assert_eq!(config.mailbox.recipients, vec!["postmaster@example"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"127.0.0.1:2525\"\nhostname = \"file.host\"\n\n\
             [mailbox]\nrecipients = [\"a@file\"]\n\n[logging]\nlevel = \"warn\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = Config::from_args(cli(&[
            "-c",
            path,
            "--hostname",
            "cli.host",
            "--recipient",
            "x@cli",
            "--recipient",
            "y@cli",
        ]))
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:2525");
        assert_eq!(config.hostname, "cli.host");
        assert_eq!(config.recipients, vec!["x@cli", "y@cli"]);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_args(cli(&["-c", "/nonexistent/submitd.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        let err = Config::from_args(cli(&["-c", file.path().to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(..)));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_args(cli(&["-l", "not-an-address"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen(ref s) if s == "not-an-address"));

        let err = Config::from_args(cli(&["--buffer-size", "1"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_args(cli(&["--max-connections", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
