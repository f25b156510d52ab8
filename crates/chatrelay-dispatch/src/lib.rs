//! chatrelay-dispatch: completion dispatch with bounded sequential retries.
//!
//! The [`Dispatcher`] resolves the target endpoint through the shared
//! [`EndpointRegistry`], picks the model to request, and calls the upstream
//! until one attempt succeeds or the retry budget is spent. It never returns
//! an error: exhaustion is reported as [`DispatchOutcome::Exhausted`], which
//! still carries displayable text.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatrelay_config::RelayConfig;
use chatrelay_core::{Completion, CompletionRequest, Endpoint};
use chatrelay_endpoints::EndpointRegistry;
use chatrelay_telemetry::{MetricsRecorder, NoopMetricsRecorder};
use tracing::{error, info};

/// Longest message or response excerpt written to the log, in characters.
pub const PREVIEW_CHARS: usize = 100;

/// How many attempts a dispatch makes and how long it waits between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    max_retries: u32,

    /// Pause between a failed attempt and the next one.
    retry_delay: Duration,
}

impl RetryPolicy {
    /// `max_retries` below 1 is raised to 1.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self::new(cfg.defaults.max_retries, cfg.retry_delay())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Metadata of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSuccess {
    pub text: String,
    pub model_used: String,
    pub endpoint_used: String,
    /// Duration of the attempt that succeeded.
    pub elapsed: Duration,
    /// 1-based number of the attempt that succeeded.
    pub attempts: u32,
    pub total_tokens: Option<u64>,
}

/// Terminal failure after every attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub model_used: String,
    pub endpoint_used: String,
    pub attempts: u32,
    /// Description of the final attempt's failure.
    pub last_error: String,
}

impl DispatchFailure {
    /// The text handed to callers in place of a model answer.
    pub fn error_text(&self) -> String {
        format!("Error: Model call failed. Reason: {}", self.last_error)
    }
}

/// Result of one dispatch: either an answer or exhaustion, never a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(DispatchSuccess),
    Exhausted(DispatchFailure),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Number of upstream attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success(s) => s.attempts,
            Self::Exhausted(f) => f.attempts,
        }
    }

    pub fn model_used(&self) -> &str {
        match self {
            Self::Success(s) => &s.model_used,
            Self::Exhausted(f) => &f.model_used,
        }
    }

    pub fn endpoint_used(&self) -> &str {
        match self {
            Self::Success(s) => &s.endpoint_used,
            Self::Exhausted(f) => &f.endpoint_used,
        }
    }

    /// Flatten to the text-only shape: the answer, or the error description.
    pub fn into_text(self) -> String {
        match self {
            Self::Success(s) => s.text,
            Self::Exhausted(f) => f.error_text(),
        }
    }
}

/// Pick the model to request from `endpoint`.
///
/// A missing `requested` model means `global_default`. The endpoint's own
/// default model replaces the request only when the request equals the
/// global default and the endpoint is not `"default"`, so a caller cannot
/// ask another endpoint for the global default model by name.
pub fn resolve_model(requested: Option<&str>, global_default: &str, endpoint: &Endpoint) -> String {
    let requested = requested.unwrap_or(global_default);

    match endpoint.default_model.as_deref() {
        Some(endpoint_model) if !endpoint.is_default() && requested == global_default => {
            endpoint_model.to_string()
        }
        _ => requested.to_string(),
    }
}

/// Truncate `text` to `max_chars` characters, appending `...` when cut.
pub fn preview(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

/// Issues completion calls against the registry with bounded retries.
///
/// Holds only shared, read-only state; one dispatcher serves any number of
/// concurrent requests.
pub struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    policy: RetryPolicy,
    default_model: String,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Dispatcher {
    pub fn new<S: Into<String>>(
        registry: Arc<EndpointRegistry>,
        policy: RetryPolicy,
        default_model: S,
    ) -> Self {
        Self {
            registry,
            policy,
            default_model: default_model.into(),
            metrics: Arc::new(NoopMetricsRecorder),
        }
    }

    /// Build a dispatcher from configuration, sharing `registry`.
    pub fn from_config(cfg: &RelayConfig, registry: Arc<EndpointRegistry>) -> Self {
        Self::new(registry, RetryPolicy::from_config(cfg), cfg.defaults.model.clone())
    }

    /// Attach a shared `MetricsRecorder`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Dispatch with the configured retry policy.
    pub async fn dispatch(&self, request: &CompletionRequest) -> DispatchOutcome {
        self.dispatch_with_policy(request, self.policy).await
    }

    /// Dispatch with an explicit retry policy.
    ///
    /// Attempts run strictly one after another. The delay between them is an
    /// awaited sleep, so other tasks on the runtime keep running; there is no
    /// way to cancel a sequence other than dropping the future.
    pub async fn dispatch_with_policy(
        &self,
        request: &CompletionRequest,
        policy: RetryPolicy,
    ) -> DispatchOutcome {
        if !self.registry.contains(&request.endpoint_name) {
            self.metrics
                .record_error(Some(&request.endpoint_name), "unknown_endpoint");
        }

        let entry = self.registry.resolve(&request.endpoint_name);
        let endpoint_name = entry.name().to_string();
        let model = resolve_model(
            request.model_name.as_deref(),
            &self.default_model,
            entry.endpoint(),
        );
        let max_retries = policy.max_retries();

        info!(
            endpoint = %endpoint_name,
            model = %model,
            "User query: {}",
            preview(request.last_user_message(), PREVIEW_CHARS)
        );

        self.metrics
            .record_request_start(Some(&endpoint_name), Some(&model));
        let dispatch_started = Instant::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            let result = entry
                .client()
                .chat_completion(&model, &request.messages, request.temperature)
                .await;

            match result {
                Ok(completion) => {
                    let elapsed = attempt_started.elapsed();
                    self.log_success(&endpoint_name, &model, &completion, elapsed);
                    self.metrics.record_request_end(
                        Some(&endpoint_name),
                        Some(&model),
                        true,
                        Some(dispatch_started.elapsed().as_secs_f64()),
                    );

                    return DispatchOutcome::Success(DispatchSuccess {
                        total_tokens: completion.total_tokens(),
                        text: completion.text,
                        model_used: model,
                        endpoint_used: endpoint_name,
                        elapsed,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    error!(
                        endpoint = %endpoint_name,
                        model = %model,
                        attempt,
                        max_retries,
                        kind = err.kind(),
                        transient = err.is_transient(),
                        "Error calling chat completion (attempt {}/{}): {}",
                        attempt,
                        max_retries,
                        err
                    );
                    self.metrics
                        .record_attempt_failure(Some(&endpoint_name), err.kind());

                    if attempt >= max_retries {
                        error!(
                            endpoint = %endpoint_name,
                            "Maximum retries reached, returning error message"
                        );
                        self.metrics.record_request_end(
                            Some(&endpoint_name),
                            Some(&model),
                            false,
                            Some(dispatch_started.elapsed().as_secs_f64()),
                        );

                        return DispatchOutcome::Exhausted(DispatchFailure {
                            model_used: model,
                            endpoint_used: endpoint_name,
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }

                    tokio::time::sleep(policy.retry_delay()).await;
                }
            }
        }
    }

    fn log_success(&self, endpoint: &str, model: &str, completion: &Completion, elapsed: Duration) {
        let tokens = completion
            .total_tokens()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "n/a".to_string());

        info!(
            endpoint,
            model,
            tokens = completion.total_tokens(),
            duration_secs = elapsed.as_secs_f64(),
            "Call time: {}, Model: {}, Tokens: {}, Duration: {:.2}s",
            completion.received_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S%.3f"),
            model,
            tokens,
            elapsed.as_secs_f64()
        );

        info!(
            endpoint,
            model,
            "Model response: {}",
            preview(&completion.text, PREVIEW_CHARS)
        );
    }
}
