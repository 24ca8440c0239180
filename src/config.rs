//! Configuration module for the channel-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::packet::DEFAULT_MAX_FRAME_SIZE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "channel-echo")]
#[command(author = "channel-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP channel server with a loopback self-test client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent channels
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum frame body size in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Number of messages the self-test client sends
    #[arg(long)]
    pub messages: Option<usize>,

    /// Delay between self-test messages in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Serve until interrupted instead of running the self-test client
    #[arg(long)]
    pub no_client: bool,

    /// Close the self-test connection with a reset instead of a FIN
    #[arg(long)]
    pub abortive_close: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent channels
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum frame body size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Self-test client configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_messages")]
    pub messages: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// How long to wait after closing before shutting the server down
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default)]
    pub abortive_close: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            enabled: true,
            messages: default_messages(),
            interval_ms: default_interval_ms(),
            linger_ms: default_linger_ms(),
            abortive_close: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

fn default_messages() -> usize {
    5
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_linger_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved self-test client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub enabled: bool,
    pub messages: usize,
    pub interval: Duration,
    pub linger: Duration,
    pub abortive_close: bool,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub client: ClientConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let client = toml_config.client;

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.server.max_frame_size),
            client: ClientConfig {
                enabled: client.enabled && !cli.no_client,
                messages: cli.messages.unwrap_or(client.messages),
                interval: Duration::from_millis(cli.interval_ms.unwrap_or(client.interval_ms)),
                linger: Duration::from_millis(client.linger_ms),
                abortive_close: cli.abortive_close || client.abortive_close,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
