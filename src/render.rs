//! Response rendering
//!
//! Every response leaves through [`ResponseRenderer`], success or failure,
//! as a `{meta, data}` envelope:
//!
//! ```json
//! {"meta": {"message": "OK", "code": 200}, "data": {"trackings": [...]}}
//! ```
//!
//! Error `data` depends on the error:
//!
//! | error | `data` |
//! |---|---|
//! | any 500 | `{"status": {"message": "Processing Failed", "code": 500}}` |
//! | 413, 415, or meta code exactly 400 | `{}` |
//! | everything else | what the caller sent |
//!
//! A 500 never carries the underlying message; the renderer logs it and
//! sends `Internal error`.

use std::any::Any;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::engine::JobOutcome;
use crate::error::{ApiError, ApiResult, ErrorKind};

/// Methods a crawl resource declares
pub const CRAWL_RESOURCE_METHODS: &str = "GET, POST";

/// Allowed request headers advertised on every response
const ALLOW_HEADERS: &str = "X-Requested-With";

// ============================================================================
// Envelope
// ============================================================================

/// `meta` half of the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Human-readable message
    pub message: String,
    /// Application code, may differ from the HTTP status
    pub code: u16,
}

/// The only body shape the gateway ever sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message and application code
    pub meta: Meta,
    /// Payload; an empty object when there is nothing to say
    pub data: Value,
}

impl Envelope {
    /// Envelope with an explicit message and code
    pub fn new(message: impl Into<String>, code: u16, data: Value) -> Self {
        Self {
            meta: Meta {
                message: message.into(),
                code,
            },
            data,
        }
    }

    /// `200 OK` envelope
    pub fn ok(data: Value) -> Self {
        Self::new("OK", 200, data)
    }

    /// Serialized body, newline terminated
    pub fn to_body(&self) -> String {
        let mut body = json!({
            "meta": { "message": self.meta.message, "code": self.meta.code },
            "data": self.data,
        })
        .to_string();
        body.push('\n');
        body
    }
}

/// `data` sent with every 500
pub fn processing_failed() -> Value {
    json!({ "status": { "message": "Processing Failed", "code": 500 } })
}

fn empty_data() -> Value {
    Value::Object(Map::new())
}

// ============================================================================
// Renderer
// ============================================================================

/// How spider-reported errors in a finished job are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeErrorMode {
    /// Any reported error turns the response into a 500
    Strict,
    /// Errors are returned next to the items under `data.errors`
    Permissive,
}

impl std::fmt::Display for OutcomeErrorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeErrorMode::Strict => write!(f, "strict"),
            OutcomeErrorMode::Permissive => write!(f, "permissive"),
        }
    }
}

/// Renders results for one resource
#[derive(Debug, Clone)]
pub struct ResponseRenderer {
    allow_methods: HeaderValue,
    outcome_errors: OutcomeErrorMode,
}

impl ResponseRenderer {
    /// Renderer for a resource declaring `allow_methods`
    pub fn new(allow_methods: &'static str, outcome_errors: OutcomeErrorMode) -> Self {
        Self {
            allow_methods: HeaderValue::from_static(allow_methods),
            outcome_errors,
        }
    }

    /// Renderer for paths with no resource behind them
    pub fn unrouted() -> Self {
        Self::new("", OutcomeErrorMode::Strict)
    }

    /// Active outcome-error mode
    pub fn outcome_errors(&self) -> OutcomeErrorMode {
        self.outcome_errors
    }

    /// Map a job result or a pipeline error to a status and envelope
    pub fn render(&self, result: ApiResult<JobOutcome>, context: &Value) -> (StatusCode, Envelope) {
        match result.and_then(|outcome| self.outcome_data(outcome)) {
            Ok(data) => (StatusCode::OK, Envelope::ok(data)),
            Err(err) => render_error(&err, context),
        }
    }

    /// [`render`](Self::render) as an HTTP response
    pub fn respond(&self, result: ApiResult<JobOutcome>, context: &Value) -> Response {
        let (status, envelope) = self.render(result, context);
        self.response(status, &envelope)
    }

    /// Error response
    pub fn respond_error(&self, err: &ApiError, context: &Value) -> Response {
        let (status, envelope) = render_error(err, context);
        self.response(status, &envelope)
    }

    /// Health check response: `200 OK` with empty `data`
    pub fn respond_health(&self) -> Response {
        self.response(StatusCode::OK, &Envelope::ok(empty_data()))
    }

    /// Attach headers to a rendered envelope
    pub fn response(&self, status: StatusCode, envelope: &Envelope) -> Response {
        let body = envelope.to_body();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            self.allow_methods.clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );

        (status, headers, Body::from(body)).into_response()
    }

    fn outcome_data(&self, outcome: JobOutcome) -> ApiResult<Value> {
        let mut data = Map::new();
        data.insert("trackings".to_string(), Value::Array(outcome.items));

        if outcome.errors.is_empty() {
            return Ok(Value::Object(data));
        }

        match self.outcome_errors {
            OutcomeErrorMode::Strict => {
                error!(errors = ?outcome.errors, "Crawl finished with errors");
                Err(ApiError::internal())
            }
            OutcomeErrorMode::Permissive => {
                warn!(errors = ?outcome.errors, "Crawl finished with errors, returning them");
                data.insert("errors".to_string(), Value::Array(outcome.errors));
                Ok(Value::Object(data))
            }
        }
    }
}

/// Status and envelope for an error
pub fn render_error(err: &ApiError, context: &Value) -> (StatusCode, Envelope) {
    let status = err.status();

    if status.is_server_error() {
        error!(
            status = status.as_u16(),
            code = err.meta_code(),
            cause = %err.message(),
            "Request failed with server error"
        );
        return (
            status,
            Envelope::new(
                ErrorKind::Internal.default_message(),
                err.meta_code(),
                processing_failed(),
            ),
        );
    }

    warn!(
        status = status.as_u16(),
        code = err.meta_code(),
        message = %err.message(),
        "Request rejected"
    );

    let data = match status {
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::PAYLOAD_TOO_LARGE => empty_data(),
        StatusCode::BAD_REQUEST if err.meta_code() == 400 => empty_data(),
        _ => context.clone(),
    };
    (status, Envelope::new(err.message(), err.meta_code(), data))
}

/// 404 for any path without a resource
pub fn not_found(context: &Value) -> Response {
    ResponseRenderer::unrouted().respond_error(&ApiError::new(ErrorKind::NotFound), context)
}

/// Panic boundary for `tower_http::catch_panic`
pub fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "Handler panicked");

    ResponseRenderer::new(CRAWL_RESOURCE_METHODS, OutcomeErrorMode::Strict)
        .respond_error(&ApiError::internal(), &empty_data())
}
