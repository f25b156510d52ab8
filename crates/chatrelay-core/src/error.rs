//! Error types for chatrelay.
//!
//! Everything the config loader, the upstream clients and the endpoint
//! registry can fail with. Unknown endpoint names are not an error: they
//! resolve to `"default"`.

/// The main error type for chatrelay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("Invalid configuration for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// Upstream answered with a non-success status or an error payload
    #[error("Upstream '{endpoint}' returned status {status}: {message}")]
    Upstream {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Invalid HTTP response from an upstream endpoint
    #[error("Invalid response from endpoint '{endpoint}': {message}")]
    InvalidResponse { endpoint: String, message: String },

    /// HTTP client errors (wraps reqwest errors)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timed out after {0}s")]
    Timeout(u64),
}

impl RelayError {
    /// Create a config error with a message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid config error
    pub fn invalid_config<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an upstream status error
    pub fn upstream<E: Into<String>, M: Into<String>>(endpoint: E, status: u16, message: M) -> Self {
        Self::Upstream {
            endpoint: endpoint.into(),
            status,
            message: message.into(),
        }
    }

    /// Create an invalid response error
    pub fn invalid_response<E: Into<String>, M: Into<String>>(endpoint: E, message: M) -> Self {
        Self::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Check if this error is transient (worth retrying against the same upstream)
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpClient(_) | Self::Timeout(_) => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short, stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidConfig { .. } => "config",
            Self::Upstream { .. } => "upstream_status",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::HttpClient(_) => "http",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for chatrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
