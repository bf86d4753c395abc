//! Configuration module for mmap-httpd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the HTTP server
#[derive(Parser, Debug)]
#[command(name = "mmap-httpd")]
#[command(author = "mmap-httpd authors")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven static file HTTP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory files are served from
    #[arg(short = 'r', long)]
    pub doc_root: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections across all workers
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

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
    pub site: SiteConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events returned per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// What is served and how
#[derive(Debug, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_doc_root")]
    pub doc_root: PathBuf,
    /// File served for `/`
    #[serde(default = "default_index")]
    pub index: String,
    /// Content-Type of served files
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Longest document root + URL path, in bytes
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            doc_root: default_doc_root(),
            index: default_index(),
            content_type: default_content_type(),
            max_path_len: default_max_path_len(),
        }
    }
}

/// Per-connection buffer sizes
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
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

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_doc_root() -> PathBuf {
    PathBuf::from("./www")
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_content_type() -> String {
    "text/html".to_string()
}

fn default_max_path_len() -> usize {
    200
}

fn default_read_buffer_size() -> usize {
    2048
}

fn default_write_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub doc_root: PathBuf,
    pub index: String,
    pub content_type: String,
    pub max_path_len: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            events_capacity: toml_config.server.events_capacity,
            doc_root: cli.doc_root.unwrap_or(toml_config.site.doc_root),
            index: toml_config.site.index,
            content_type: toml_config.site.content_type,
            max_path_len: toml_config.site.max_path_len,
            read_buffer_size: toml_config.connection.read_buffer_size,
            write_buffer_size: toml_config.connection.write_buffer_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("server.max_connections", self.max_connections),
            ("server.events_capacity", self.events_capacity),
            ("connection.read_buffer_size", self.read_buffer_size),
            ("connection.write_buffer_size", self.write_buffer_size),
            ("site.max_path_len", self.max_path_len),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(key, "must be greater than zero"));
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(key, reason) => {
                write!(f, "Invalid configuration '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
