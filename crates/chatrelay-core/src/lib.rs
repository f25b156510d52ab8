//! Core types, errors, and shared functionality for chatrelay.
//!
//! This crate provides the foundational types used throughout the chatrelay system:
//!
//! - **Error types**: Comprehensive error handling with [`RelayError`] and [`Result`]
//! - **Endpoint types**: Named upstream descriptors (base URL, credential, default model)
//! - **Message types**: Conversation turns, per-call requests, and upstream completions
//!
//! # Overview
//!
//! chatrelay-core holds the domain model shared by the config, endpoint,
//! dispatch, and proxy crates. It carries no business logic of its own.
//!
//! # Examples
//!
//! ## Describing an endpoint
//!
//! ```rust
//! use chatrelay_core::endpoint::Endpoint;
//!
//! let endpoint = Endpoint::new("local1", "http://127.0.0.1:11434/v1")
//!     .with_default_model("llama3.2:3b");
//! assert!(!endpoint.has_credential());
//! ```
//!
//! ## Building a request
//!
//! ```rust
//! use chatrelay_core::{CompletionRequest, Message};
//!
//! let request = CompletionRequest::new(vec![Message::user("hi")])
//!     .with_endpoint("local1")
//!     .with_temperature(0.2);
//! assert_eq!(request.last_user_message(), "hi");
//! ```

pub mod endpoint;
pub mod error;
pub mod message;

// Re-export commonly used types for convenience
pub use endpoint::{Endpoint, DEFAULT_ENDPOINT, NO_CREDENTIAL};
pub use error::{RelayError, Result};
pub use message::{Completion, CompletionRequest, Message, Usage, DEFAULT_TEMPERATURE};

/// Prelude module for convenient imports.
///
/// ```rust
/// use chatrelay_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::endpoint::{Endpoint, DEFAULT_ENDPOINT};
    pub use crate::error::{RelayError, Result};
    pub use crate::message::{Completion, CompletionRequest, Message, Usage};
}
