//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the API_KEYS env var or `pool.keys_file`,
//! never stored in the TOML directly to avoid leaking secrets.

use common::{ApiKey, parse_key_list};
use completion::DEFAULT_BASE_URL;
use dispatch::{AttemptSpec, DispatchSettings, RetryLadder};
use key_pool::{PoolSettings, QuotaLimits};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when neither `--config` nor CONFIG_PATH is given.
pub const DEFAULT_CONFIG_PATH: &str = "gemini-relay.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub upstream: UpstreamConfig,
    pub dispatch: DispatchConfig,
    /// Resolved from API_KEYS or `pool.keys_file`.
    #[serde(skip)]
    pub api_keys: Vec<ApiKey>,
}

/// How `/generate` reports a dispatch failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// HTTP 200 with the error text as the `response` value.
    #[default]
    Inline,
    /// Non-2xx status with a structured error body.
    Status,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub error_mode: ErrorMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_connections: 1000,
            error_mode: ErrorMode::Inline,
        }
    }
}

/// Key pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// File with one key per line (or comma-separated), used when API_KEYS is unset
    pub keys_file: Option<PathBuf>,
    pub reset_interval_secs: u64,
    pub backoff_ms: u64,
    pub scan_jitter_ms: u64,
    /// Usage snapshot file; persistence is disabled when unset
    pub snapshot_path: Option<PathBuf>,
    pub persist_on_reserve: bool,
    pub limits: QuotaLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keys_file: None,
            reset_interval_secs: 60,
            backoff_ms: 1000,
            scan_jitter_ms: 0,
            snapshot_path: None,
            persist_on_reserve: false,
            limits: QuotaLimits::default(),
        }
    }
}

/// Gemini API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 600,
        }
    }
}

/// Retry ladder and pacing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub retry_backoff_ms: u64,
    pub acquire_timeout_secs: Option<u64>,
    /// Replaces the built-in pro/flash ladder when present
    pub ladder: Option<Vec<AttemptSpec>>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1000,
            acquire_timeout_secs: None,
            ladder: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Like [`Config::load`], but a missing file at the default location
    /// means built-in defaults. An explicitly named file must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
            return Config::default().finish();
        }
        Self::load(path)
    }

    /// Parse TOML contents, resolve API keys and validate.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.finish()
    }

    fn finish(mut self) -> common::Result<Self> {
        self.api_keys = self.resolve_keys()?;
        self.validate()?;
        Ok(self)
    }

    /// Key resolution order:
    /// 1. API_KEYS env var
    /// 2. keys_file path from config
    fn resolve_keys(&self) -> common::Result<Vec<ApiKey>> {
        let keys = match std::env::var("API_KEYS") {
            Ok(raw) if !raw.trim().is_empty() => parse_key_list(&raw),
            _ => match &self.pool.keys_file {
                Some(path) => {
                    let raw = std::fs::read_to_string(path).map_err(|e| {
                        common::Error::Config(format!(
                            "failed to read keys_file {}: {e}",
                            path.display()
                        ))
                    })?;
                    parse_key_list(&raw)
                }
                None => Vec::new(),
            },
        };
        if keys.is_empty() {
            return Err(common::Error::Config(
                "no API keys configured: set API_KEYS or pool.keys_file".into(),
            ));
        }
        Ok(keys)
    }

    fn validate(&self) -> common::Result<()> {
        // Validate base_url is a valid URL with http(s) scheme
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }

        let non_zero = [
            ("upstream.timeout_secs", self.upstream.timeout_secs),
            ("pool.reset_interval_secs", self.pool.reset_interval_secs),
            ("pool.backoff_ms", self.pool.backoff_ms),
            ("server.max_connections", self.server.max_connections as u64),
            (
                "dispatch.acquire_timeout_secs",
                self.dispatch.acquire_timeout_secs.unwrap_or(1),
            ),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.pool.persist_on_reserve && self.pool.snapshot_path.is_none() {
            return Err(common::Error::Config(
                "pool.persist_on_reserve requires pool.snapshot_path".into(),
            ));
        }

        self.pool
            .limits
            .validate()
            .map_err(|e| common::Error::Config(format!("pool.limits: {e}")))?;
        self.ladder()
            .map_err(|e| common::Error::Config(format!("dispatch.ladder: {e}")))?;
        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            limits: self.pool.limits,
            reset_interval: Duration::from_secs(self.pool.reset_interval_secs),
            backoff: Duration::from_millis(self.pool.backoff_ms),
            scan_jitter: Duration::from_millis(self.pool.scan_jitter_ms),
            persist_on_reserve: self.pool.persist_on_reserve,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            retry_backoff: Duration::from_millis(self.dispatch.retry_backoff_ms),
            call_timeout: Duration::from_secs(self.upstream.timeout_secs),
            acquire_timeout: self.dispatch.acquire_timeout_secs.map(Duration::from_secs),
        }
    }

    /// The configured ladder, or the built-in one when none is given.
    pub fn ladder(&self) -> Result<RetryLadder, dispatch::LadderError> {
        match &self.dispatch.ladder {
            Some(attempts) => RetryLadder::new(attempts.clone()),
            None => Ok(RetryLadder::default()),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}
