//! Conversation messages and per-call completion types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::DEFAULT_ENDPOINT;

/// Sampling temperature used when the caller does not provide one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Well-known message roles. `Message::role` stays a free-form string.
pub mod role {
    pub const SYSTEM: &str = "system";
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
}

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Role of the sender (system, user, assistant)
    pub role: String,

    /// Content of the message
    pub content: String,
}

impl Message {
    pub fn new<R: Into<String>, C: Into<String>>(role: R, content: C) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system<C: Into<String>>(content: C) -> Self {
        Self::new(role::SYSTEM, content)
    }

    pub fn user<C: Into<String>>(content: C) -> Self {
        Self::new(role::USER, content)
    }

    pub fn assistant<C: Into<String>>(content: C) -> Self {
        Self::new(role::ASSISTANT, content)
    }

    pub fn is_user(&self) -> bool {
        self.role == role::USER
    }
}

/// A single chat-completion call as handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Ordered conversation history; never empty once validated.
    pub messages: Vec<Message>,

    /// Logical endpoint to send the request to.
    pub endpoint_name: String,

    /// Explicit model choice. `None` means "the global default model".
    pub model_name: Option<String>,

    /// Sampling temperature, passed through unchanged.
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            endpoint_name: DEFAULT_ENDPOINT.to_string(),
            model_name: None,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_name: S) -> Self {
        self.endpoint_name = endpoint_name.into();
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model_name: S) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Content of the last user turn, or an empty string if there is none.
    pub fn last_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Token accounting reported by an upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,

    #[serde(default)]
    pub completion_tokens: u64,

    #[serde(default)]
    pub total_tokens: u64,
}

/// Text produced by one successful upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
    pub received_at: DateTime<Utc>,
}

impl Completion {
    pub fn new<S: Into<String>>(text: S, usage: Option<Usage>) -> Self {
        Self {
            text: text.into(),
            usage,
            received_at: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.total_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = CompletionRequest::new(vec![Message::user("hi")]);
        assert_eq!(req.endpoint_name, DEFAULT_ENDPOINT);
        assert!(req.model_name.is_none());
        assert_eq!(req.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn test_last_user_message_picks_latest_user_turn() {
        let req = CompletionRequest::new(vec![
            Message::system("be brief"),
            Message::user("first"),
            Message::assistant("answer"),
            Message::user("second"),
        ]);
        assert_eq!(req.last_user_message(), "second");

        let no_user = CompletionRequest::new(vec![Message::system("only system")]);
        assert_eq!(no_user.last_user_message(), "");
    }

    #[test]
    fn test_message_accepts_free_form_roles() {
        let msg: Message = serde_json::from_str(r#"{"role":"tool","content":"42"}"#).unwrap();
        assert_eq!(msg.role, "tool");
        assert!(!msg.is_user());
    }

    #[test]
    fn test_usage_tolerates_missing_fields() {
        let usage: Usage = serde_json::from_str(r#"{"total_tokens": 17}"#).unwrap();
        assert_eq!(usage.total_tokens, 17);
        assert_eq!(usage.prompt_tokens, 0);

        let completion = Completion::new("ok", Some(usage));
        assert_eq!(completion.total_tokens(), Some(17));
    }
}
