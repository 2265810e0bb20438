//! Server configuration module.
//!
//! Parses configuration from environment variables for the Moltarena
//! realtime server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `MOLTARENA_DATA_URL` | Yes | - | Base URL of the agents/rooms data service |
//! | `MOLTARENA_DATA_SERVICE_KEY` | Yes | - | Service key sent with data-service requests |
//! | `MOLTARENA_REDIS_URL` | No | - | Coordination store URL; absent means single-instance mode |
//! | `MOLTARENA_FRONTEND_ORIGIN` | No | `http://localhost:5173` | Allowed CORS origin |
//! | `MOLTARENA_TURN_WINDOW_MS` | No | 10000 | Spacing between accepted turns per agent |
//! | `MOLTARENA_VOTE_TTL_SECS` | No | 86400 | Lifetime of the one-shot vote flag |
//! | `PORT` | No | 8080 | HTTP server port |

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default allowed CORS origin (local frontend dev server).
const DEFAULT_FRONTEND_ORIGIN: &str = "http://localhost:5173";

/// Default turn submission window in milliseconds.
const DEFAULT_TURN_WINDOW_MS: u64 = 10_000;

/// Default vote flag TTL in seconds (24 hours).
const DEFAULT_VOTE_TTL_SECS: u64 = 86_400;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the external data service.
    pub data_service_url: String,

    /// Shared key authenticating this server to the data service.
    pub data_service_key: String,

    /// Redis URL for the coordination store. `None` falls back to the
    /// in-memory store: rate limits and broadcasts stay correct on one
    /// instance but do not span processes.
    pub redis_url: Option<String>,

    /// Allowed CORS origin for the frontend.
    pub frontend_origin: String,

    /// Spacing between accepted turns per agent.
    pub turn_window: Duration,

    /// Lifetime of the one-vote-per-room flag.
    pub vote_ttl: Duration,

    /// HTTP server port.
    pub port: u16,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or any
    /// value fails to parse.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use moltarena_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_service_url = require_env("MOLTARENA_DATA_URL")?;
        let data_service_key = require_env("MOLTARENA_DATA_SERVICE_KEY")?;
        let redis_url = env::var("MOLTARENA_REDIS_URL").ok().filter(|s| !s.is_empty());
        let frontend_origin = env::var("MOLTARENA_FRONTEND_ORIGIN")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_FRONTEND_ORIGIN.to_string());
        let turn_window = Duration::from_millis(parse_u64_env(
            "MOLTARENA_TURN_WINDOW_MS",
            DEFAULT_TURN_WINDOW_MS,
        )?);
        let vote_ttl = Duration::from_secs(parse_u64_env(
            "MOLTARENA_VOTE_TTL_SECS",
            DEFAULT_VOTE_TTL_SECS,
        )?);
        let port = parse_port()?;

        let config = Self {
            data_service_url,
            data_service_key,
            redis_url,
            frontend_origin,
            turn_window,
            vote_ttl,
            port,
        };

        config.validate()?;

        if config.redis_url.is_none() {
            warn!(
                "MOLTARENA_REDIS_URL is not set - running single-instance; \
                 broadcasts and rate limits will not span processes"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_service_url.starts_with("http://")
            && !self.data_service_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidFormat {
                var: "MOLTARENA_DATA_URL".to_string(),
                message: "must start with http:// or https://".to_string(),
            });
        }

        if self.turn_window.is_zero() {
            return Err(ConfigError::InvalidFormat {
                var: "MOLTARENA_TURN_WINDOW_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.vote_ttl.is_zero() {
            return Err(ConfigError::InvalidFormat {
                var: "MOLTARENA_VOTE_TTL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Reads a required, non-empty environment variable.
fn require_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Parses an optional u64 environment variable with a default.
fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => {
            value.parse().map_err(|_| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("expected an unsigned integer, got '{value}'"),
            })
        }
        _ => Ok(default),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
