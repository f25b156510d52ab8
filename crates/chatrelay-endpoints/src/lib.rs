use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_config::RelayConfig;
use chatrelay_core::endpoint::{Endpoint, DEFAULT_ENDPOINT};
use chatrelay_core::{RelayError, Result};
use thiserror::Error;

pub mod client;

pub use client::{OpenAiCompatibleClient, UpstreamClient};

/// Errors specific to endpoint registry operations.
#[derive(Debug, Error)]
pub enum EndpointRegistryError {
    #[error("duplicate endpoint name: {0}")]
    DuplicateEndpointName(String),

    #[error("invalid endpoint for '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },

    #[error("registry has no 'default' endpoint")]
    MissingDefaultEndpoint,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl From<EndpointRegistryError> for RelayError {
    fn from(err: EndpointRegistryError) -> Self {
        RelayError::config(err.to_string())
    }
}

/// A single entry in the registry: the endpoint descriptor and its client.
#[derive(Clone)]
pub struct EndpointEntry {
    endpoint: Endpoint,
    client: Arc<dyn UpstreamClient>,
}

impl EndpointEntry {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }
}

impl std::fmt::Debug for EndpointEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointEntry")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// The immutable set of upstreams this relay can forward to.
///
/// Built once at startup through [`EndpointRegistryBuilder`] (or
/// [`EndpointRegistry::from_config`]) and shared as `Arc<EndpointRegistry>`
/// afterwards. Nothing mutates it after `build`, so concurrent requests read
/// it without locking.
///
/// A registry always contains a `"default"` entry; [`resolve`](Self::resolve)
/// falls back to it for unknown names.
#[derive(Debug)]
pub struct EndpointRegistry {
    /// The `"default"` entry, kept apart so resolution never has to unwrap.
    default: EndpointEntry,

    /// All other entries keyed by logical name.
    endpoints: HashMap<String, EndpointEntry>,
}

impl EndpointRegistry {
    /// Construct a registry from the loaded configuration.
    ///
    /// One `reqwest::Client` (carrying the configured request timeout) is
    /// shared by every endpoint, and one [`OpenAiCompatibleClient`] is built
    /// per endpoint up front. No upstream is contacted.
    pub fn from_config(cfg: &RelayConfig) -> Result<Self> {
        let timeout = cfg.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EndpointRegistryError::HttpClient(e.to_string()))?;

        let mut builder = EndpointRegistryBuilder::new();
        for endpoint in cfg.resolved_endpoints() {
            let client = OpenAiCompatibleClient::new(http.clone(), endpoint.clone(), timeout);
            builder.register(endpoint, Arc::new(client))?;
        }

        builder.build()
    }

    /// Return the number of configured endpoints, `"default"` included.
    pub fn len(&self) -> usize {
        self.endpoints.len() + 1
    }

    /// Always `false`: a built registry holds at least `"default"`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Get an endpoint entry by exact name, without fallback.
    pub fn get(&self, name: &str) -> Option<&EndpointEntry> {
        if name == DEFAULT_ENDPOINT {
            Some(&self.default)
        } else {
            self.endpoints.get(name)
        }
    }

    /// Whether `name` is a configured endpoint.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The `"default"` entry.
    pub fn default_entry(&self) -> &EndpointEntry {
        &self.default
    }

    /// Resolve an endpoint name to its entry.
    ///
    /// Unknown names log a warning and resolve to `"default"`; this never
    /// fails.
    pub fn resolve(&self, name: &str) -> &EndpointEntry {
        match self.get(name) {
            Some(entry) => entry,
            None => {
                tracing::warn!(
                    requested = name,
                    "unknown endpoint '{}', falling back to '{}'",
                    name,
                    DEFAULT_ENDPOINT
                );
                &self.default
            }
        }
    }

    /// Iterate over all entries, `"default"` first and the rest by name.
    pub fn iter(&self) -> impl Iterator<Item = &EndpointEntry> {
        let mut rest: Vec<&EndpointEntry> = self.endpoints.values().collect();
        rest.sort_by(|a, b| a.name().cmp(b.name()));
        std::iter::once(&self.default).chain(rest)
    }
}

/// Startup-time population of an [`EndpointRegistry`].
#[derive(Default)]
pub struct EndpointRegistryBuilder {
    endpoints: HashMap<String, EndpointEntry>,
}

impl EndpointRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint with its ready-made client.
    ///
    /// Rejects empty names, empty base URLs, and names already registered.
    pub fn register(
        &mut self,
        endpoint: Endpoint,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<&mut Self> {
        if endpoint.name.trim().is_empty() {
            return Err(EndpointRegistryError::InvalidEndpoint {
                name: endpoint.name,
                reason: "name must not be empty".to_string(),
            }
            .into());
        }

        if endpoint.base_url.trim().is_empty() {
            return Err(EndpointRegistryError::InvalidEndpoint {
                name: endpoint.name,
                reason: "base_url must not be empty".to_string(),
            }
            .into());
        }

        if self.endpoints.contains_key(&endpoint.name) {
            return Err(EndpointRegistryError::DuplicateEndpointName(endpoint.name).into());
        }

        self.endpoints
            .insert(endpoint.name.clone(), EndpointEntry { endpoint, client });
        Ok(self)
    }

    /// Freeze the registry. Fails if no `"default"` endpoint was registered.
    pub fn build(mut self) -> Result<EndpointRegistry> {
        let default = self
            .endpoints
            .remove(DEFAULT_ENDPOINT)
            .ok_or(EndpointRegistryError::MissingDefaultEndpoint)?;

        Ok(EndpointRegistry {
            default,
            endpoints: self.endpoints,
        })
    }
}
