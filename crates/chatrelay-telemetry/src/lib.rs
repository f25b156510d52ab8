use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::prelude::*;

#[cfg(feature = "prometheus")]
pub use crate::prometheus_impl::{prometheus_http_response, PrometheusMetricsRecorder};

/// Error type for telemetry initialisation failures.
///
/// This is intentionally lightweight so `chatrelay-telemetry` can be used
/// without depending on `chatrelay-core`. Callers can map this into their own
/// error types as needed.
#[derive(Debug)]
pub enum TelemetryError {
    /// Provided log level string could not be parsed.
    InvalidLevel(String),

    /// The log file could not be opened for appending.
    LogFile(String),

    /// Failed to configure the subscriber (should be rare).
    SubscriberInit(String),

    /// Failed to create or register a metric.
    Metrics(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::InvalidLevel(level) => {
                write!(f, "invalid log level: {}", level)
            }
            TelemetryError::LogFile(msg) => write!(f, "failed to open log file: {}", msg),
            TelemetryError::SubscriberInit(msg) => write!(f, "failed to init telemetry: {}", msg),
            TelemetryError::Metrics(msg) => write!(f, "failed to set up metrics: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Interface for recording relay-level metrics.
///
/// The dispatcher reports through this trait so it never depends on a
/// concrete backend.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Record that a dispatch has started.
    ///
    /// - `endpoint`: resolved endpoint name, if known.
    /// - `model`: resolved model name, if known.
    fn record_request_start(&self, endpoint: Option<&str>, model: Option<&str>);

    /// Record that a dispatch has completed.
    ///
    /// - `success`: `false` when every attempt failed.
    /// - `latency_secs`: wall-clock time of the whole dispatch, retries included.
    fn record_request_end(
        &self,
        endpoint: Option<&str>,
        model: Option<&str>,
        success: bool,
        latency_secs: Option<f64>,
    );

    /// Record one failed upstream attempt.
    ///
    /// - `kind`: a short, stable error kind string (e.g. "timeout",
    ///   "upstream_status", "invalid_response").
    fn record_attempt_failure(&self, endpoint: Option<&str>, kind: &str);

    /// Record an error not tied to a single attempt (e.g. "unknown_endpoint").
    fn record_error(&self, endpoint: Option<&str>, kind: &str);
}

/// A no-op metrics recorder that does nothing.
///
/// This is useful as a default implementation in environments where metrics
/// are not configured or desired.
#[derive(Debug, Clone, Default)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn record_request_start(&self, _endpoint: Option<&str>, _model: Option<&str>) {}

    fn record_request_end(
        &self,
        _endpoint: Option<&str>,
        _model: Option<&str>,
        _success: bool,
        _latency_secs: Option<f64>,
    ) {
    }

    fn record_attempt_failure(&self, _endpoint: Option<&str>, _kind: &str) {}

    fn record_error(&self, _endpoint: Option<&str>, _kind: &str) {}
}

#[cfg(feature = "prometheus")]
pub mod prometheus_impl {
    use super::{MetricsRecorder, Result, TelemetryError};

    use hyper::{body::Bytes, Response};
    use prometheus::{
        Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    };

    /// Encode the registry into Prometheus' text exposition format.
    ///
    /// Encoding failures become a 500 with a plain-text body.
    pub fn prometheus_http_response(registry: &Registry) -> Response<Bytes> {
        let encoder = TextEncoder::new();
        let metric_families = registry.gather();

        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            let body = format!("failed to encode Prometheus metrics: {}", err);
            return Response::builder()
                .status(500)
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(Bytes::from(body))
                .unwrap_or_else(|_| Response::new(Bytes::from_static(b"internal error")));
        }

        Response::builder()
            .status(200)
            .header("Content-Type", encoder.format_type())
            .body(Bytes::from(buffer))
            .unwrap_or_else(|_| Response::new(Bytes::from_static(b"internal error")))
    }

    fn metric_err(name: &str, err: prometheus::Error) -> TelemetryError {
        TelemetryError::Metrics(format!("{}: {}", name, err))
    }

    /// Prometheus-backed metrics recorder.
    #[derive(Clone)]
    pub struct PrometheusMetricsRecorder {
        registry: Registry,
        requests_total: IntCounterVec,
        request_latency_seconds: HistogramVec,
        attempt_failures_total: IntCounterVec,
        errors_total: IntCounterVec,
    }

    impl PrometheusMetricsRecorder {
        /// Create a new Prometheus-backed recorder with a fresh registry.
        pub fn new() -> Result<Self> {
            let registry = Registry::new_custom(Some("chatrelay".to_string()), None)
                .map_err(|e| metric_err("registry", e))?;

            let requests_total = IntCounterVec::new(
                Opts::new("requests_total", "Completed dispatches"),
                &["endpoint", "model", "success"],
            )
            .map_err(|e| metric_err("requests_total", e))?;
            registry
                .register(Box::new(requests_total.clone()))
                .map_err(|e| metric_err("requests_total", e))?;

            let request_latency_seconds = HistogramVec::new(
                HistogramOpts::new(
                    "request_latency_seconds",
                    "Dispatch latency in seconds, retries included",
                ),
                &["endpoint", "model"],
            )
            .map_err(|e| metric_err("request_latency_seconds", e))?;
            registry
                .register(Box::new(request_latency_seconds.clone()))
                .map_err(|e| metric_err("request_latency_seconds", e))?;

            let attempt_failures_total = IntCounterVec::new(
                Opts::new("attempt_failures_total", "Failed upstream attempts"),
                &["endpoint", "kind"],
            )
            .map_err(|e| metric_err("attempt_failures_total", e))?;
            registry
                .register(Box::new(attempt_failures_total.clone()))
                .map_err(|e| metric_err("attempt_failures_total", e))?;

            let errors_total = IntCounterVec::new(
                Opts::new("errors_total", "Errors outside the attempt loop"),
                &["endpoint", "kind"],
            )
            .map_err(|e| metric_err("errors_total", e))?;
            registry
                .register(Box::new(errors_total.clone()))
                .map_err(|e| metric_err("errors_total", e))?;

            Ok(Self {
                registry,
                requests_total,
                request_latency_seconds,
                attempt_failures_total,
                errors_total,
            })
        }

        /// Access the underlying Prometheus registry, for use by HTTP exporters.
        pub fn registry(&self) -> &Registry {
            &self.registry
        }
    }

    impl MetricsRecorder for PrometheusMetricsRecorder {
        fn record_request_start(&self, _endpoint: Option<&str>, _model: Option<&str>) {}

        fn record_request_end(
            &self,
            endpoint: Option<&str>,
            model: Option<&str>,
            success: bool,
            latency_secs: Option<f64>,
        ) {
            let endpoint_label = endpoint.unwrap_or("_unknown");
            let model_label = model.unwrap_or("_unknown");
            let success_label = if success { "true" } else { "false" };

            self.requests_total
                .with_label_values(&[endpoint_label, model_label, success_label])
                .inc();

            if let Some(lat) = latency_secs {
                self.request_latency_seconds
                    .with_label_values(&[endpoint_label, model_label])
                    .observe(lat);
            }
        }

        fn record_attempt_failure(&self, endpoint: Option<&str>, kind: &str) {
            self.attempt_failures_total
                .with_label_values(&[endpoint.unwrap_or("_unknown"), kind])
                .inc();
        }

        fn record_error(&self, endpoint: Option<&str>, kind: &str) {
            self.errors_total
                .with_label_values(&[endpoint.unwrap_or("_unknown"), kind])
                .inc();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn exported_text_contains_recorded_series() {
            let recorder = PrometheusMetricsRecorder::new().expect("recorder");
            recorder.record_request_end(Some("local1"), Some("M1"), true, Some(0.25));
            recorder.record_attempt_failure(Some("local1"), "timeout");

            let resp = prometheus_http_response(recorder.registry());
            assert_eq!(resp.status(), 200);

            let body = String::from_utf8(resp.body().to_vec()).expect("utf8 body");
            assert!(body.contains("chatrelay_requests_total"));
            assert!(body.contains("chatrelay_attempt_failures_total"));
            assert!(body.contains("local1"));
        }
    }
}

/// Options for [`init`].
#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Log level or filter expression. Takes precedence over `RUST_LOG`.
    pub level: Option<String>,

    /// Append-only log file written alongside stdout (without ANSI colours).
    pub log_file: Option<PathBuf>,
}

/// Initialise the global logging subscriber.
///
/// Level selection:
/// - `options.level` if provided,
/// - else `RUST_LOG` if set,
/// - else `"info"`.
///
/// Lines go to stdout and, when `options.log_file` is set, are appended to
/// that file as well. Rotation and retention of the file are left to the
/// operator (logrotate with `copytruncate`, for instance).
///
/// ```ignore
/// chatrelay_telemetry::init(TelemetryOptions {
///     level: Some("debug".into()),
///     log_file: Some("app.log".into()),
/// })?;
/// ```
pub fn init(options: TelemetryOptions) -> Result<()> {
    let filter = if let Some(level_str) = options.level.as_deref() {
        parse_level_filter(level_str)?
    } else if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };

    // Local offset falls back to UTC when it cannot be determined (e.g. in
    // multi-threaded processes on some platforms).
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(OffsetTime::new(offset, Rfc3339));

    let file_layer = match options.log_file.as_ref() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TelemetryError::LogFile(format!("{}: {}", path.display(), e)))?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(OffsetTime::new(offset, Rfc3339))
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

/// Parse a simple level string into an `EnvFilter`.
///
/// Supports both plain levels ("info", "debug", etc.) and full `EnvFilter`
/// expressions (like "info,chatrelay_dispatch=debug").
fn parse_level_filter(level_str: &str) -> Result<EnvFilter> {
    if Level::from_str(level_str).is_ok() {
        return Ok(EnvFilter::new(level_str));
    }

    EnvFilter::builder()
        .parse(level_str)
        .map_err(|e| TelemetryError::InvalidLevel(format!("{} ({})", level_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_level() {
        let f = parse_level_filter("info").expect("should parse info level");
        let _ = f;
    }

    #[test]
    fn parse_full_expression() {
        let f = parse_level_filter("info,chatrelay_dispatch=debug").expect("should parse expression");
        let _ = f;
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let res = init(TelemetryOptions {
            level: Some("info".to_string()),
            log_file: Some(PathBuf::from("/this/definitely/does/not/exist/app.log")),
        });
        assert!(matches!(res, Err(TelemetryError::LogFile(_))));
    }

    #[test]
    fn noop_metrics_recorder_does_not_panic() {
        let recorder = NoopMetricsRecorder;

        recorder.record_request_start(Some("local1"), Some("M1"));
        recorder.record_request_end(Some("local1"), Some("M1"), true, Some(0.123));
        recorder.record_attempt_failure(Some("local1"), "timeout");
        recorder.record_error(None, "unknown_endpoint");
    }
}
