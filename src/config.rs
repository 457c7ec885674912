//! Configuration module for the fjson binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand, ValueEnum};
use fjson::{ServeMode, ServerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "fjson")]
#[command(author = "fjson authors")]
#[command(version = "0.1.0")]
#[command(about = "NUL-framed JSON request/response over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run a server
    Serve(ServeArgs),
    /// Send one JSON document and print the response
    Send(SendArgs),
}

/// Arguments for `serve`
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Per-connection timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Request handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Serve several exchanges per connection
    #[arg(long)]
    pub keep_alive: bool,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,
}

/// Arguments for `send`
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address (e.g., 127.0.0.1:8080)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Dial and exchange timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Number of exchanges; more than one reuses a single connection
    /// and needs a keep-alive server
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// JSON document to send
    pub message: String,
}

/// Built-in request handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Return the request unchanged
    Echo,
    /// SHA-256 each string in `messages`
    Digest,
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
    /// Per-connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Request handler
    #[serde(default = "default_handler")]
    pub handler: HandlerKind,
    /// Serve several exchanges per connection
    #[serde(default)]
    pub keep_alive: bool,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            timeout_ms: default_timeout_ms(),
            handler: default_handler(),
            keep_alive: false,
            backlog: default_backlog(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server address
    #[serde(default = "default_listen")]
    pub host: String,
    /// Dial and exchange timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_listen(),
            timeout_ms: default_timeout_ms(),
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
    "127.0.0.1:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_handler() -> HandlerKind {
    HandlerKind::Echo
}

fn default_backlog() -> i32 {
    fjson::server::DEFAULT_BACKLOG
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved settings for `serve`
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub server: ServerConfig,
    pub handler: HandlerKind,
}

/// Resolved settings for `send`
#[derive(Debug, Clone)]
pub struct SendSettings {
    pub host: String,
    pub timeout: Duration,
    pub count: usize,
    pub message: String,
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Command {
    Serve(ServeSettings),
    Send(SendSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub command: Command,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let command = match cli.command {
            CliCommand::Serve(args) => {
                let server = &toml_config.server;
                let mode = if args.keep_alive || server.keep_alive {
                    ServeMode::KeepAlive
                } else {
                    ServeMode::OneShot
                };
                let timeout_ms = args.timeout_ms.unwrap_or(server.timeout_ms);

                Command::Serve(ServeSettings {
                    server: ServerConfig::new(
                        args.listen.unwrap_or_else(|| server.listen.clone()),
                        Duration::from_millis(timeout_ms),
                    )
                    .with_mode(mode)
                    .with_backlog(args.backlog.unwrap_or(server.backlog)),
                    handler: args.handler.unwrap_or(server.handler),
                })
            }
            CliCommand::Send(args) => {
                let client = &toml_config.client;
                let timeout_ms = args.timeout_ms.unwrap_or(client.timeout_ms);

                Command::Send(SendSettings {
                    host: args.host.unwrap_or_else(|| client.host.clone()),
                    timeout: Duration::from_millis(timeout_ms),
                    count: args.count,
                    message: args.message,
                })
            }
        };

        Config {
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            command,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{file}': {source}", file = .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{file}': {source}", file = .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.timeout_ms, 1000);
        assert_eq!(config.server.handler, HandlerKind::Echo);
        assert!(!config.server.keep_alive);
        assert_eq!(config.client.host, "127.0.0.1:8080");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            timeout_ms = 2500
            handler = "digest"
            keep_alive = true
            backlog = 128

            [client]
            host = "10.0.0.1:9000"
            timeout_ms = 300

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.timeout_ms, 2500);
        assert_eq!(config.server.handler, HandlerKind::Digest);
        assert!(config.server.keep_alive);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.client.host, "10.0.0.1:9000");
        assert_eq!(config.client.timeout_ms, 300);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_serve_defaults() {
        let config = Config::merge(parse(&["fjson", "serve"]), TomlConfig::default());
        assert_eq!(config.log_level, "info");
        match config.command {
            Command::Serve(settings) => {
                assert_eq!(settings.server, ServerConfig::default());
                assert_eq!(settings.handler, HandlerKind::Echo);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            timeout_ms = 2500

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();
        let cli = parse(&[
            "fjson",
            "--log-level",
            "trace",
            "serve",
            "--listen",
            "127.0.0.1:7000",
            "--handler",
            "digest",
            "--keep-alive",
        ]);

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.log_level, "trace");
        match config.command {
            Command::Serve(settings) => {
                assert_eq!(settings.server.listen, "127.0.0.1:7000");
                assert_eq!(settings.server.timeout, Duration::from_millis(2500));
                assert_eq!(settings.server.mode, ServeMode::KeepAlive);
                assert_eq!(settings.handler, HandlerKind::Digest);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileRead {
            path: PathBuf::from("missing.toml"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err
            .to_string()
            .starts_with("Failed to read config file 'missing.toml': "));

        let source = toml::from_str::<TomlConfig>("[server").unwrap_err();
        let err = ConfigError::TomlParse {
            path: PathBuf::from("bad.toml"),
            source,
        };
        assert!(err
            .to_string()
            .starts_with("Failed to parse config file 'bad.toml': "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_send_args() {
        let cli = parse(&[
            "fjson",
            "send",
            "-H",
            "localhost:8080",
            "-t",
            "250",
            r#"{"greetings":"hello"}"#,
        ]);

        match Config::merge(cli, TomlConfig::default()).command {
            Command::Send(settings) => {
                assert_eq!(settings.host, "localhost:8080");
                assert_eq!(settings.timeout, Duration::from_millis(250));
                assert_eq!(settings.count, 1);
                assert_eq!(settings.message, r#"{"greetings":"hello"}"#);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
