//! Upstream clients.
//!
//! [`UpstreamClient`] is the seam between the dispatcher and the network:
//! production code uses [`OpenAiCompatibleClient`], tests plug in fakes.

use std::time::Duration;

use async_trait::async_trait;
use chatrelay_core::{Completion, Endpoint, Message, RelayError, Result, Usage};
use serde::{Deserialize, Serialize};

/// A ready-to-use handle for one upstream endpoint.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Issue a single, non-streaming chat completion.
    ///
    /// Exactly one upstream call is made; retrying is the caller's concern.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f64,
    ) -> Result<Completion>;
}

/// Client for OpenAI-compatible `POST {base_url}/chat/completions` APIs.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    url: String,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    /// Wrap a shared `reqwest::Client` for the given endpoint.
    ///
    /// `timeout` is used only to label timeout errors; the deadline itself is
    /// configured on `http`.
    pub fn new(http: reqwest::Client, endpoint: Endpoint, timeout: Duration) -> Self {
        let url = endpoint.chat_completions_url();
        Self {
            http,
            endpoint,
            url,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Value for the `Authorization` header, if this endpoint has a credential.
    pub fn authorization_header(&self) -> Option<String> {
        self.endpoint
            .has_credential()
            .then(|| format!("Bearer {}", self.endpoint.api_key.trim()))
    }

    fn map_send_error(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::Timeout(self.timeout.as_secs())
        } else {
            RelayError::HttpClient(err)
        }
    }

    fn into_completion(&self, body: ChatCompletionResponse) -> Result<Completion> {
        if let Some(error) = body.error {
            return Err(RelayError::invalid_response(
                &self.endpoint.name,
                format!("upstream error payload: {}", error),
            ));
        }

        let choice = body.choices.into_iter().next().ok_or_else(|| {
            RelayError::invalid_response(&self.endpoint.name, "response contained no choices")
        })?;

        let text = choice.message.content.ok_or_else(|| {
            RelayError::invalid_response(&self.endpoint.name, "first choice has no content")
        })?;

        Ok(Completion::new(text, body.usage))
    }
}

#[async_trait]
impl UpstreamClient for OpenAiCompatibleClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f64,
    ) -> Result<Completion> {
        let body = ChatCompletionBody {
            model,
            messages,
            temperature,
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(auth) = self.authorization_header() {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.text().await {
                Ok(body) => body,
                Err(err) => format!("<failed to read response body: {}>", err),
            };
            return Err(RelayError::upstream(
                &self.endpoint.name,
                status.as_u16(),
                message,
            ));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout(self.timeout.as_secs())
            } else {
                RelayError::invalid_response(&self.endpoint.name, e.to_string())
            }
        })?;

        self.into_completion(parsed)
    }
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,

    #[serde(default)]
    usage: Option<Usage>,

    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(base_url: String, api_key: &str) -> OpenAiCompatibleClient {
        let endpoint = Endpoint::new("local1", base_url).with_api_key(api_key);
        OpenAiCompatibleClient::new(reqwest::Client::new(), endpoint, Duration::from_secs(5))
    }

    #[test]
    fn authorization_header_skips_sentinel_credential() {
        let anonymous = client_for("http://127.0.0.1:1/v1".to_string(), "no-credential");
        assert!(anonymous.authorization_header().is_none());

        let keyed = client_for("http://127.0.0.1:1/v1".to_string(), "sk-test");
        assert_eq!(keyed.authorization_header().as_deref(), Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn chat_completion_returns_first_choice_and_usage() {
        let server = MockServer::start_async().await;

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .json_body_partial(r#"{"model": "M1", "temperature": 0.2}"#);
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "id": "cmpl-1",
                        "choices": [
                            {"index": 0, "message": {"role": "assistant", "content": "hello there"}}
                        ],
                        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
                    }));
            })
            .await;

        let client = client_for(server.url("/v1"), "sk-test");
        let completion = client
            .chat_completion("M1", &[Message::user("hi")], 0.2)
            .await
            .expect("completion");

        mock.assert_async().await;
        assert_eq!(completion.text, "hello there");
        assert_eq!(completion.total_tokens(), Some(7));
    }

    #[tokio::test]
    async fn non_success_status_becomes_upstream_error() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(503).body("overloaded");
            })
            .await;

        let client = client_for(server.url("/v1"), "sk-test");
        let err = client
            .chat_completion("M1", &[Message::user("hi")], 0.7)
            .await
            .expect_err("503 must fail");

        match err {
            RelayError::Upstream {
                endpoint,
                status,
                message,
            } => {
                assert_eq!(endpoint, "local1");
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_content_is_an_invalid_response() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({"choices": []}));
            })
            .await;

        let client = client_for(server.url("/v1"), "no-credential");
        let err = client
            .chat_completion("M1", &[Message::user("hi")], 0.7)
            .await
            .expect_err("empty choices must fail");

        assert_eq!(err.kind(), "invalid_response");
    }

    #[tokio::test]
    async fn error_payload_with_ok_status_is_rejected() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({"error": {"message": "model not loaded"}}));
            })
            .await;

        let client = client_for(server.url("/v1"), "no-credential");
        let err = client
            .chat_completion("M1", &[Message::user("hi")], 0.7)
            .await
            .expect_err("error payload must fail");

        assert!(err.to_string().contains("model not loaded"));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let client = client_for("http://127.0.0.1:1/v1".to_string(), "no-credential");
        let err = client
            .chat_completion("M1", &[Message::user("hi")], 0.7)
            .await
            .expect_err("nothing listens on port 1");

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn truncated_error_body_is_reported_in_upstream_message() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            // Drain the whole request so closing the socket does not reset it.
            loop {
                let n = socket.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            // Promise 100 bytes, deliver 5, hang up.
            let _ = socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\nshort")
                .await;
            let _ = socket.shutdown().await;
        });

        let client = client_for(format!("http://{addr}/v1"), "no-credential");
        let err = client
            .chat_completion("M1", &[Message::user("hi")], 0.7)
            .await
            .expect_err("500 must fail");

        match err {
            RelayError::Upstream { status, message, .. } => {
                assert_eq!(status, 500);
                assert!(message.contains("failed to read response body"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
