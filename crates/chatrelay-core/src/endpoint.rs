//! Upstream endpoint descriptors.
//!
//! An [`Endpoint`] names one OpenAI-compatible upstream (hosted API, vLLM,
//! Ollama, llama.cpp, ...) together with the credential and model the relay
//! uses for it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the endpoint every registry is guaranteed to contain.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Sentinel credential for upstreams that do not require authentication.
pub const NO_CREDENTIAL: &str = "no-credential";

/// A configured upstream language-model API.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    /// Unique name for this endpoint (e.g. "default", "local1")
    pub name: String,

    /// Base URL for the endpoint (e.g., "http://127.0.0.1:11434/v1")
    pub base_url: String,

    /// Credential sent as a bearer token, or [`NO_CREDENTIAL`]
    pub api_key: String,

    /// Model served when the caller does not pick one explicitly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Endpoint {
    /// Create a new endpoint without credential or default model
    pub fn new<N: Into<String>, U: Into<String>>(name: N, base_url: U) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: NO_CREDENTIAL.to_string(),
            default_model: None,
        }
    }

    /// Set the credential for this endpoint
    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set the default model for this endpoint
    pub fn with_default_model<S: Into<String>>(mut self, model: S) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Whether this is the always-present fallback endpoint
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_ENDPOINT
    }

    /// Whether requests to this endpoint should carry an `Authorization` header
    pub fn has_credential(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && key != NO_CREDENTIAL
    }

    /// URL of the chat-completions route below `base_url`
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Mask a credential for display, keeping the sentinel readable.
pub fn redact(api_key: &str) -> &str {
    if api_key == NO_CREDENTIAL || api_key.is_empty() {
        api_key
    } else {
        "***"
    }
}
