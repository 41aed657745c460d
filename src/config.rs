//! Configuration module for coop-httpd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::Endpoint;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

/// Scheduler backend driving the listener and its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Current-thread tokio runtime with a `LocalSet`.
    Tokio,
    /// Hand-driven mio readiness loop.
    Mio,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "coop-httpd")]
#[command(author = "coop-httpd authors")]
#[command(version)]
#[command(about = "A minimal single-threaded HTTP/1.1 keep-alive server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Scheduler backend
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Fetch `/` from HOST:PORT once, print the response and exit
    #[arg(long, value_name = "HOST:PORT")]
    pub get: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Scheduler backend
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Initial capacity of each session's receive buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime: default_runtime(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// HTTP codec limits
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    /// Maximum size of a request head (request line + headers)
    #[serde(default = "default_max_headers_size")]
    pub max_headers_size: usize,
    /// Maximum size of a request body
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_headers_size: default_max_headers_size(),
            max_body_size: default_max_body_size(),
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
    8080
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Tokio
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    8 * 1024
}

fn default_max_headers_size() -> usize {
    64 * 1024
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub runtime: RuntimeType,
    pub backlog: i32,
    pub buffer_size: usize,
    pub max_headers_size: usize,
    pub max_body_size: usize,
    pub log_level: String,
    pub get: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(
            CliArgs {
                config: None,
                host: None,
                port: None,
                runtime: None,
                log_level: None,
                get: None,
            },
            TomlConfig::default(),
        )
    }
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

        Ok(Config::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            backlog: toml_config.server.backlog,
            buffer_size: toml_config.server.buffer_size,
            max_headers_size: toml_config.http.max_headers_size,
            max_body_size: toml_config.http.max_body_size,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            get: cli.get,
        }
    }

    /// The listening endpoint described by `host` and `port`.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let addr: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(Endpoint::new(addr, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String),
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
        }
    }
}

impl std::error::Error for ConfigError {}
