//! Request tracing and log setup
//!
//! ```text
//! Request ──> RequestIdLayer ──> TraceLayer ──> crawl resource
//!                  │                  │
//!                  ▼                  ▼
//!            x-request-id      http_request span
//!            (kept or new)     (id, method, path, status, latency)
//! ```
//!
//! Log output goes to stderr in one of three formats chosen by
//! `GATEWAY_LOG_FORMAT`; `RUST_LOG` filters as usual.

use axum::http::{header::HeaderName, HeaderValue, Request, Response};
use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tower::{Layer, Service};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{MakeSpan, OnRequest, OnResponse, TraceLayer},
};
use tracing::{info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Header carrying the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Env var selecting the log format
pub const LOG_FORMAT_ENV: &str = "GATEWAY_LOG_FORMAT";

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Filter used with `--verbose` when `RUST_LOG` is unset
pub const VERBOSE_LOG_FILTER: &str = "debug,hyper=info";

// ============================================================================
// Request ID
// ============================================================================

/// Identifier tying together every log line of one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Fresh random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// ID supplied by the caller
    pub fn from_header(value: &str) -> Self {
        Self(value.into())
    }

    /// ID as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keeps a caller's `x-request-id` or assigns one, and echoes it back
#[derive(Clone, Debug)]
pub struct RequestIdLayer {
    header_name: HeaderName,
}

impl RequestIdLayer {
    /// Layer using `x-request-id`
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }
}

impl Default for RequestIdLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            header_name: self.header_name.clone(),
        }
    }
}

/// Service behind [`RequestIdLayer`]
#[derive(Clone, Debug)]
pub struct RequestIdService<S> {
    inner: S,
    header_name: HeaderName,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = RequestIdFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let request_id = request
            .headers()
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(RequestId::from_header)
            .unwrap_or_default();

        request.extensions_mut().insert(request_id.clone());

        RequestIdFuture {
            future: self.inner.call(request),
            request_id,
            header_name: self.header_name.clone(),
        }
    }
}

/// Response future of [`RequestIdService`]
#[pin_project::pin_project]
pub struct RequestIdFuture<F> {
    #[pin]
    future: F,
    request_id: RequestId,
    header_name: HeaderName,
}

impl<F, ResBody, E> std::future::Future for RequestIdFuture<F>
where
    F: std::future::Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut response = match this.future.poll(cx) {
            Poll::Ready(Ok(response)) => response,
            other => return other,
        };

        if let Ok(value) = HeaderValue::from_str(this.request_id.as_str()) {
            response
                .headers_mut()
                .insert(this.header_name.clone(), value);
        }
        Poll::Ready(Ok(response))
    }
}

// ============================================================================
// Trace layer
// ============================================================================

/// Opens the `http_request` span
#[derive(Clone, Debug)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(RequestId::as_str)
            .unwrap_or("unknown");

        info_span!(
            "http_request",
            request_id = %request_id,
            method = %request.method(),
            path = %request.uri().path(),
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}

/// Logs the start of a request
#[derive(Clone, Debug)]
pub struct OnRequestLog;

impl<B> OnRequest<B> for OnRequestLog {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        tracing::debug!(
            target: "http::request",
            method = %request.method(),
            uri = %request.uri(),
            "incoming request"
        );
    }
}

/// Records status and latency on the span
#[derive(Clone, Debug, Default)]
pub struct OnResponseLog;

impl<B> OnResponse<B> for OnResponseLog {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        span.record("status", status);
        span.record("latency_ms", latency_ms);

        tracing::info!(
            target: "http::response",
            status,
            latency_ms,
            "response sent"
        );
    }
}

/// tower-http trace layer wired to the gateway's span and loggers
pub fn request_tracing_layer(
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan, OnRequestLog, OnResponseLog>
{
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_request(OnRequestLog)
        .on_response(OnResponseLog)
}

// ============================================================================
// Subscriber
// ============================================================================

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line
    Compact,
}

impl LogFormat {
    /// Format from `GATEWAY_LOG_FORMAT`; JSON in release builds otherwise
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or(if cfg!(debug_assertions) {
                LogFormat::Pretty
            } else {
                LogFormat::Json
            })
    }

    /// Case-insensitive name lookup
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `verbose` when set.
pub fn init_tracing(format: LogFormat, verbose: bool) {
    let default_filter = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
