//! Configuration loading and types for chatrelay.
//!
//! This crate is responsible for:
//! - Defining the top-level configuration model used by the daemon and other crates
//! - Loading configuration from TOML files
//! - Providing a simple default search strategy (e.g. /etc/chatrelay/chatrelay.toml, ./chatrelay.toml)
//! - Applying the `HOST`, `PORT`, `DEFAULT_MODEL`, `API_BASE` and `API_KEY`
//!   environment overrides (optionally sourced from a `.env` file)
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-endpoint configuration.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use chatrelay_core::endpoint::{Endpoint, DEFAULT_ENDPOINT, NO_CREDENTIAL};
use chatrelay_core::{RelayError, Result, DEFAULT_TEMPERATURE};

/// Model used when neither the caller nor the endpoint picks one.
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

/// Upstream base URL of the `"default"` endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.siliconflow.cn/v1";

/// Root configuration struct for chatrelay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Listener for the HTTP facade.
    #[serde(default)]
    pub server: ServerConfig,

    /// Global defaults and the `"default"` upstream.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Additional named upstreams.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

impl RelayConfig {
    /// Perform basic structural validation of the configuration.
    ///
    /// This does not contact any upstream; it only rejects values that would
    /// make the registry or the retry loop ill-formed.
    pub fn validate(&self) -> Result<()> {
        self.validate_defaults()?;
        self.validate_endpoints()?;
        Ok(())
    }

    fn validate_defaults(&self) -> Result<()> {
        if self.defaults.model.trim().is_empty() {
            return Err(RelayError::invalid_config(
                "defaults.model",
                "defaults.model must not be empty",
            ));
        }

        validate_base_url("defaults.base_url", DEFAULT_ENDPOINT, &self.defaults.base_url)?;

        if self.defaults.max_retries == 0 {
            return Err(RelayError::invalid_config(
                "defaults.max_retries",
                "defaults.max_retries must be at least 1",
            ));
        }

        let delay = self.defaults.retry_delay_secs;
        if Duration::try_from_secs_f64(delay).is_err() {
            return Err(RelayError::invalid_config(
                "defaults.retry_delay_secs",
                format!(
                    "defaults.retry_delay_secs must be a non-negative number of seconds \
                     representable as a duration (got {delay})"
                ),
            ));
        }

        if self.defaults.request_timeout_secs == 0 {
            return Err(RelayError::invalid_config(
                "defaults.request_timeout_secs",
                "defaults.request_timeout_secs must be at least 1",
            ));
        }

        Ok(())
    }

    fn validate_endpoints(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for ep in &self.endpoints {
            if ep.name.trim().is_empty() {
                return Err(RelayError::invalid_config(
                    "endpoints.name",
                    "endpoint name must not be empty",
                ));
            }

            if !seen.insert(ep.name.as_str()) {
                return Err(RelayError::invalid_config(
                    "endpoints.name",
                    format!("duplicate endpoint name: {}", ep.name),
                ));
            }

            validate_base_url("endpoints.base_url", &ep.name, &ep.base_url)?;
        }

        Ok(())
    }

    /// Retry delay as a `Duration`.
    ///
    /// Values `validate` would reject yield the built-in default delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.defaults.retry_delay_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_delay_secs()))
    }

    /// Per-request upstream timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.request_timeout_secs)
    }

    /// The full endpoint table, `"default"` first.
    ///
    /// The `"default"` entry is synthesised from `[defaults]` unless the file
    /// declares an `[[endpoints]]` entry with that name, in which case the
    /// declared entry wins. Entries without `api_key` inherit the defaults
    /// credential. Entries other than `"default"` without `default_model` keep
    /// none, so requests to them use the requested or global default model.
    pub fn resolved_endpoints(&self) -> Vec<Endpoint> {
        let mut out = Vec::with_capacity(self.endpoints.len() + 1);

        if !self.endpoints.iter().any(|ep| ep.name == DEFAULT_ENDPOINT) {
            out.push(
                Endpoint::new(DEFAULT_ENDPOINT, self.defaults.base_url.trim())
                    .with_api_key(self.defaults.api_key.clone())
                    .with_default_model(self.defaults.model.clone()),
            );
        }

        for ep in &self.endpoints {
            let mut endpoint = Endpoint::new(ep.name.trim(), ep.base_url.trim()).with_api_key(
                ep.api_key
                    .clone()
                    .unwrap_or_else(|| self.defaults.api_key.clone()),
            );
            endpoint.default_model = ep.default_model.clone();
            if ep.name == DEFAULT_ENDPOINT && endpoint.default_model.is_none() {
                endpoint.default_model = Some(self.defaults.model.clone());
            }
            out.push(endpoint);
        }

        out.sort_by_key(|ep| !ep.is_default());
        out
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply environment-style overrides using an arbitrary lookup.
    ///
    /// Recognised keys: `HOST`, `PORT`, `DEFAULT_MODEL`, `API_BASE`, `API_KEY`.
    /// Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }

        if let Some(port) = get("PORT") {
            self.server.port = port.trim().parse().map_err(|err| {
                RelayError::invalid_config("PORT", format!("invalid port '{port}': {err}"))
            })?;
        }

        if let Some(model) = get("DEFAULT_MODEL") {
            self.defaults.model = model;
        }

        if let Some(base) = get("API_BASE") {
            self.defaults.base_url = base;
        }

        if let Some(key) = get("API_KEY") {
            self.defaults.api_key = key;
        }

        Ok(())
    }

    /// Effective log level configured in the file, if any.
    pub fn log_level(&self) -> Option<&str> {
        self.telemetry.as_ref().and_then(|t| t.log_level.as_deref())
    }

    /// Append-only log file configured in the file, if any.
    pub fn log_file(&self) -> Option<&Path> {
        self.telemetry.as_ref().and_then(|t| t.log_file.as_deref())
    }
}

fn validate_base_url(field: &str, name: &str, base_url: &str) -> Result<()> {
    let base_url = base_url.trim();
    if base_url.is_empty() {
        return Err(RelayError::invalid_config(
            field,
            format!("endpoint '{name}' has an empty base_url"),
        ));
    }

    let parsed = Url::parse(base_url).map_err(|err| {
        RelayError::invalid_config(
            field,
            format!("endpoint '{name}' has an unparseable base_url '{base_url}': {err}"),
        )
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::invalid_config(
            field,
            format!("endpoint '{name}' base_url must start with http:// or https://"),
        ));
    }

    Ok(())
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind on. Defaults to `0.0.0.0`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. Defaults to 8989.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Global defaults shared by every request and by the `"default"` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Global default model.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the `"default"` endpoint.
    #[serde(default = "default_api_base")]
    pub base_url: String,

    /// Credential of the `"default"` endpoint, inherited by endpoints that
    /// do not set their own.
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Attempts per dispatch (not additional retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between attempts, in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,

    /// Sampling temperature when the caller omits one.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Upper bound on a single upstream call, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_api_base(),
            api_key: default_api_key(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Configuration for a single named upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Logical name for this endpoint (unique per config file).
    pub name: String,

    /// Base URL of the endpoint, typically ending in `/v1`.
    pub base_url: String,

    /// Credential; falls back to `defaults.api_key`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model this endpoint serves when the caller does not override it.
    #[serde(default)]
    pub default_model: Option<String>,
}

/// Logging configuration section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter expression (e.g. "info,chatrelay_dispatch=debug").
    #[serde(default)]
    pub log_level: Option<String>,

    /// Append-only log file in addition to stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Load configuration from a specific file path.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| {
        RelayError::config(format!(
            "failed to read config file '{}': {}",
            path_ref.display(),
            err
        ))
    })?;

    let cfg: RelayConfig = toml::from_str(&contents).map_err(|err| {
        RelayError::invalid_config(
            path_ref.display().to_string(),
            format!("failed to parse config: {}", err),
        )
    })?;

    Ok(cfg)
}

/// Default configuration file locations, in probe order.
pub fn default_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/chatrelay/chatrelay.toml"),
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("chatrelay.toml"),
    ]
}

/// Attempt to load configuration using the default search strategy.
///
/// Returns the path that was loaded, or `None` when no file exists and the
/// built-in defaults are used.
pub fn load_default() -> Result<(RelayConfig, Option<PathBuf>)> {
    for candidate in default_candidates() {
        if candidate.exists() {
            let cfg = load_from_path(&candidate)?;
            return Ok((cfg, Some(candidate)));
        }
    }

    Ok((RelayConfig::default(), None))
}

/// Load variables from a `.env` file in the working directory, if present.
///
/// Variables already set in the process environment are left untouched.
pub fn load_dotenv() -> Option<PathBuf> {
    match dotenvy::dotenv() {
        Ok(path) => Some(path),
        Err(err) if err.not_found() => None,
        Err(err) => {
            tracing::warn!("ignoring unreadable .env file: {}", err);
            None
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_api_key() -> String {
    NO_CREDENTIAL.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> f64 {
    1.0
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_request_timeout_secs() -> u64 {
    120
}
