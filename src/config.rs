//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before secrets are resolved.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// RPC server configuration
    pub server: ServerConfig,
    /// Webhook port configuration
    pub webhook: WebhookConfig,
    /// Outbound stream configuration
    pub streaming: StreamingConfig,
    /// Secret store configuration
    pub secrets: SecretsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // EVENT_GATEWAY_WEBHOOK__DISPATCH_TIMEOUT=10s etc.
        figment = figment.merge(Env::prefixed("EVENT_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!(path = %expanded, "Env file not found (skipped)");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!(path = %expanded, "Loaded env file"),
                Err(e) => tracing::warn!(path = %expanded, error = %e, "Failed to load env file"),
            }
        }
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// RPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Time allowed for producers to release resources after a session ends
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Webhook port configuration shared by every webhook event source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Address webhook ports bind on
    pub host: String,
    /// Upper bound for handing a request payload to its session
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,
    /// Maximum accepted request body size (bytes)
    pub max_body_size: usize,
    /// Time allowed for a port listener to drain on teardown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            dispatch_timeout: Duration::from_secs(5),
            max_body_size: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbound stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Capacity of each session's data channel
    pub buffer_size: usize,
    /// Keep-alive interval for SSE streams
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

/// Secret store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Prefix of environment variables holding secrets
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: "EVENT_GATEWAY_SECRET_".to_string(),
        }
    }
}

/// Human-readable serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "1h" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a message when the numeric part is not an integer or the
    /// value does not fit in a `Duration` of seconds.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (number, unit) = if let Some(ms) = s.strip_suffix("ms") {
            let millis = ms.parse::<u64>().map_err(|e| e.to_string())?;
            return Ok(Duration::from_millis(millis));
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let value = number.parse::<u64>().map_err(|e| e.to_string())?;
        value
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("{s} is out of range"))
    }
}
