//! Configuration module for the echo endpoint.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::{EndpointOptions, IncomingBidirectional};
use crate::transport::memory::TransportSettings;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the echo endpoint
#[derive(Parser, Debug)]
#[command(name = "webtransport-echo")]
#[command(version)]
#[command(about = "A WebTransport echo endpoint", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Reply sent for every received datagram
    #[arg(long)]
    pub datagram_ack: Option<String>,

    /// What to do with incoming bidirectional streams
    #[arg(short = 'b', long, value_enum)]
    pub bidirectional: Option<BidirectionalMode>,

    /// Cap on a buffered unidirectional payload in bytes
    #[arg(long)]
    pub max_unidirectional_payload: Option<usize>,

    /// Do not open the outgoing bidirectional echo stream
    #[arg(long)]
    pub no_greeting_stream: bool,

    /// Payload the loopback peer sends
    #[arg(short = 'm', long)]
    pub message: Option<String>,

    /// Unidirectional streams the loopback peer opens
    #[arg(short = 'u', long)]
    pub unidirectional_streams: Option<usize>,

    /// Bytes per chunk on loopback bidirectional streams
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Per-stream send window of the loopback transport in bytes
    #[arg(short = 'w', long)]
    pub stream_window: Option<usize>,

    /// Outgoing unidirectional streams the loopback peer allows up front
    #[arg(long)]
    pub unidirectional_credit: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Handling of incoming bidirectional streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BidirectionalMode {
    /// Echo data back on the same stream
    #[default]
    Echo,
    /// Read and drop everything
    Discard,
}

impl From<BidirectionalMode> for IncomingBidirectional {
    fn from(mode: BidirectionalMode) -> Self {
        match mode {
            BidirectionalMode::Echo => IncomingBidirectional::Echo,
            BidirectionalMode::Discard => IncomingBidirectional::Discard,
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo behavior
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_datagram_ack")]
    pub datagram_ack: String,
    #[serde(default)]
    pub bidirectional: BidirectionalMode,
    #[serde(default = "default_greeting_stream")]
    pub greeting_stream: bool,
    pub max_unidirectional_payload: Option<usize>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            datagram_ack: default_datagram_ack(),
            bidirectional: BidirectionalMode::default(),
            greeting_stream: default_greeting_stream(),
            max_unidirectional_payload: None,
        }
    }
}

/// Loopback peer and transport limits
#[derive(Debug, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_unidirectional_streams")]
    pub unidirectional_streams: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_stream_window")]
    pub stream_window: usize,
    #[serde(default = "default_unidirectional_credit")]
    pub unidirectional_credit: u64,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            message: default_message(),
            unidirectional_streams: default_unidirectional_streams(),
            chunk_size: default_chunk_size(),
            stream_window: default_stream_window(),
            unidirectional_credit: default_unidirectional_credit(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_datagram_ack() -> String {
    "who am I".to_string()
}

fn default_greeting_stream() -> bool {
    true
}

fn default_message() -> String {
    "hello, webtransport".to_string()
}

fn default_unidirectional_streams() -> usize {
    8
}

fn default_chunk_size() -> usize {
    5
}

fn default_stream_window() -> usize {
    16
}

fn default_unidirectional_credit() -> u64 {
    2
}

fn default_max_datagram_size() -> usize {
    1200
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub datagram_ack: String,
    pub bidirectional: BidirectionalMode,
    pub greeting_stream: bool,
    pub max_unidirectional_payload: Option<usize>,
    pub message: String,
    pub unidirectional_streams: usize,
    pub chunk_size: usize,
    pub stream_window: usize,
    pub unidirectional_credit: u64,
    pub max_datagram_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already parsed arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            endpoint,
            loopback,
            logging,
        } = toml_config;

        Config {
            datagram_ack: cli.datagram_ack.unwrap_or(endpoint.datagram_ack),
            bidirectional: cli.bidirectional.unwrap_or(endpoint.bidirectional),
            greeting_stream: endpoint.greeting_stream && !cli.no_greeting_stream,
            max_unidirectional_payload: cli
                .max_unidirectional_payload
                .or(endpoint.max_unidirectional_payload),
            message: cli.message.unwrap_or(loopback.message),
            unidirectional_streams: cli
                .unidirectional_streams
                .unwrap_or(loopback.unidirectional_streams),
            chunk_size: cli.chunk_size.unwrap_or(loopback.chunk_size),
            stream_window: cli.stream_window.unwrap_or(loopback.stream_window),
            unidirectional_credit: cli
                .unidirectional_credit
                .unwrap_or(loopback.unidirectional_credit),
            max_datagram_size: loopback.max_datagram_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    /// Session visitor options.
    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            datagram_ack: Bytes::from(self.datagram_ack.clone()),
            incoming_bidirectional: self.bidirectional.into(),
            greeting_stream: self.greeting_stream,
            max_unidirectional_payload: self.max_unidirectional_payload,
        }
    }

    /// Loopback transport limits.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            initial_stream_window: self.stream_window,
            outgoing_bidirectional_streams: 1,
            outgoing_unidirectional_streams: self.unidirectional_credit,
            max_datagram_size: self.max_datagram_size,
        }
    }
}

impl CliArgs {
    fn default_args() -> Self {
        Self {
            config: None,
            datagram_ack: None,
            bidirectional: None,
            max_unidirectional_payload: None,
            no_greeting_stream: false,
            message: None,
            unidirectional_streams: None,
            chunk_size: None,
            stream_window: None,
            unidirectional_credit: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.datagram_ack, "who am I");
        assert_eq!(config.bidirectional, BidirectionalMode::Echo);
        assert!(config.greeting_stream);
        assert_eq!(config.max_unidirectional_payload, None);
        assert_eq!(config.log_level, "info");

        let options = config.endpoint_options();
        assert_eq!(&options.datagram_ack[..], b"who am I");
        assert_eq!(options.incoming_bidirectional, IncomingBidirectional::Echo);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [endpoint]
            datagram_ack = "ack"
            bidirectional = "discard"
            greeting_stream = false
            max_unidirectional_payload = 4096

            [loopback]
            message = "ping"
            unidirectional_streams = 3
            stream_window = 8

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint.datagram_ack, "ack");
        assert_eq!(config.endpoint.bidirectional, BidirectionalMode::Discard);
        assert!(!config.endpoint.greeting_stream);
        assert_eq!(config.endpoint.max_unidirectional_payload, Some(4096));
        assert_eq!(config.loopback.message, "ping");
        assert_eq!(config.loopback.unidirectional_streams, 3);
        assert_eq!(config.loopback.stream_window, 8);
        assert_eq!(config.loopback.chunk_size, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [endpoint]
            datagram_ack = "from file"
            bidirectional = "discard"

            [loopback]
            stream_window = 8

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let cli = CliArgs::try_parse_from([
            "webtransport-echo",
            "--datagram-ack",
            "from cli",
            "--bidirectional",
            "echo",
            "--no-greeting-stream",
            "--log-level",
            "trace",
        ])
        .unwrap();

        let config = Config::resolve(cli, toml_config);
        assert_eq!(config.datagram_ack, "from cli");
        assert_eq!(config.bidirectional, BidirectionalMode::Echo);
        assert!(!config.greeting_stream);
        assert_eq!(config.stream_window, 8);
        assert_eq!(config.log_level, "trace");

        let settings = config.transport_settings();
        assert_eq!(settings.initial_stream_window, 8);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::try_parse_from([
            "webtransport-echo",
            "--config",
            "/nonexistent/webtransport-echo.toml",
        ])
        .unwrap();

        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
