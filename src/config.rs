//! Configuration for the hermes server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{Codec, Integrity, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
use crate::runtime::Settings;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(version = "0.1.0")]
#[command(about = "A text-framed request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Port to listen on (0 disables the listener)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of connection handler threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum header block size in bytes
    #[arg(long)]
    pub max_header_size: Option<usize>,

    /// Attach and verify MD5 body checksums
    #[arg(long, overrides_with = "no_checksums")]
    pub checksums: bool,

    /// Turn body checksums off
    #[arg(long, overrides_with = "checksums")]
    pub no_checksums: bool,

    /// Service answering requests
    #[arg(long, value_enum)]
    pub service: Option<ServiceKind>,

    /// Directory the copy service writes into
    #[arg(long)]
    pub copy_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Checksum setting given on the command line, if any.
    pub fn checksums_override(&self) -> Option<bool> {
        match (self.checksums, self.no_checksums) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Which handler the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// PING and INFO only
    #[default]
    Default,
    /// COPY file transfer on top of the defaults
    Copy,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of connection handler threads
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

/// Wire codec configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Unset follows the build's default integrity mode
    pub checksums: Option<bool>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            checksums: None,
        }
    }
}

/// Service configuration
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default = "default_copy_root")]
    pub copy_root: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            kind: ServiceKind::default(),
            copy_root: default_copy_root(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    61182
}

fn default_workers() -> usize {
    10
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_copy_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub checksums: Option<bool>,
    pub service: ServiceKind,
    pub copy_root: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let checksums = cli.checksums_override().or(file.protocol.checksums);
        Config {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            workers: cli.workers.unwrap_or(file.server.workers),
            max_header_size: cli
                .max_header_size
                .unwrap_or(file.protocol.max_header_size),
            max_body_size: file.protocol.max_body_size,
            checksums,
            service: cli.service.unwrap_or(file.service.kind),
            copy_root: cli.copy_root.unwrap_or(file.service.copy_root),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        }
    }

    /// Runtime settings for the manager.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        if self.max_header_size == 0 {
            return Err(ConfigError::InvalidHeaderSize(self.max_header_size));
        }

        let host: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;

        let integrity = match self.checksums {
            Some(enabled) => Integrity::from_enabled(enabled),
            None => Integrity::default(),
        };

        let codec = Codec {
            max_header_size: self.max_header_size,
            max_body_size: self.max_body_size,
            integrity,
        };

        Ok(Settings {
            host,
            port: self.port,
            threads: self.workers,
            codec,
            ..Settings::default()
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String),
    InvalidHeaderSize(usize),
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
            ConfigError::InvalidHost(host) => {
                write!(f, "Invalid listen address '{}'", host)
            }
            ConfigError::InvalidHeaderSize(size) => {
                write!(f, "Invalid max header size {}: must be positive", size)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
