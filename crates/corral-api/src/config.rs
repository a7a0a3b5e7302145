//! Server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use corral_core::{Error, Result};

/// Minimum permitted sweep cadence.
const MIN_SWEEP_INTERVAL_MS: u64 = 10;

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Configuration for the Corral API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled, the binary may fall back to the in-memory store and
    /// logs are pretty-printed. Production deployments run with debug off
    /// and an external store wired in by the embedder.
    pub debug: bool,

    /// Director sweep cadence in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Optional server-side cap on `/wait` requests in milliseconds.
    ///
    /// Unset means waits are bounded only by client disconnect.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,

    /// Store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            sweep_interval_ms: default_sweep_interval_ms(),
            wait_timeout_ms: None,
            store: StoreConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

/// Store configuration for the API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// External store bucket name. Required when debug is off; the
    /// backend itself is wired in by the embedding deployment.
    #[serde(default)]
    pub bucket: Option<String>,
}

/// CORS configuration for browser-based access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development
    /// only). Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            // Default: disabled (secure-by-default).
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `CORRAL_HTTP_PORT`
    /// - `CORRAL_DEBUG`
    /// - `CORRAL_SWEEP_INTERVAL_MS`
    /// - `CORRAL_WAIT_TIMEOUT_MS`
    /// - `CORRAL_STORE_BUCKET`
    /// - `CORRAL_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `CORRAL_CORS_MAX_AGE_SECONDS`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot
    /// be parsed, or if a value is out of range.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("CORRAL_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("CORRAL_DEBUG")? {
            config.debug = debug;
        }
        if let Some(interval) = env_u64("CORRAL_SWEEP_INTERVAL_MS")? {
            if interval < MIN_SWEEP_INTERVAL_MS {
                return Err(Error::InvalidArgument(format!(
                    "CORRAL_SWEEP_INTERVAL_MS must be at least {MIN_SWEEP_INTERVAL_MS}"
                )));
            }
            config.sweep_interval_ms = interval;
        }
        if let Some(timeout) = env_u64("CORRAL_WAIT_TIMEOUT_MS")? {
            if timeout == 0 {
                return Err(Error::InvalidArgument(
                    "CORRAL_WAIT_TIMEOUT_MS must be greater than 0".to_string(),
                ));
            }
            config.wait_timeout_ms = Some(timeout);
        }
        if let Some(bucket) = env_string("CORRAL_STORE_BUCKET") {
            config.store.bucket = Some(bucket);
        }
        if let Some(origins) = env_string("CORRAL_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("CORRAL_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        Ok(config)
    }

    /// Returns the director sweep cadence.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Returns the server-side wait cap, if configured.
    #[must_use]
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidArgument(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidArgument(format!("{name} must be a u64: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
