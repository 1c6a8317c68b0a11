//! Gateway Error Taxonomy
//!
//! Every failure a request can hit maps onto one row of a fixed table of
//! `(HTTP status, meta code, message)` triples. Pipeline stages construct an
//! [`ApiError`] from an [`ErrorKind`]; the renderer turns it into an envelope.
//!
//! The meta code is an application-level code and may differ from the HTTP
//! status: `4001` (invalid payload) and `4002` (invalid slug) both travel as
//! HTTP 400.

use axum::http::StatusCode;
use thiserror::Error;

/// Rows of the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // =========================================================================
    // Routing (404/405)
    // =========================================================================
    /// No resource is mounted at the requested path
    NotFound,
    /// The resource exists but does not accept the method
    MethodNotAllowed,

    // =========================================================================
    // Admission (403/413/415)
    // =========================================================================
    /// API key header missing or wrong
    InvalidApiKey,
    /// Body larger than the configured limit
    PayloadTooLarge,
    /// Content-Type is not `application/json`
    UnsupportedMediaType,

    // =========================================================================
    // Payload (400/4001/4002)
    // =========================================================================
    /// Body is not valid JSON, or not a JSON object
    InvalidJson,
    /// Body failed schema validation
    InvalidPayload,
    /// The engine does not know the requested target
    InvalidSlug,
    /// A required field is absent or empty
    MissingParameter,
    /// A fetch parameter is not recognized by the engine
    InvalidArgument,
    /// Neither a fetch URL nor start-without-fetch was requested
    UrlRequired,

    // =========================================================================
    // Capacity (429)
    // =========================================================================
    /// The dispatcher job cap is exhausted
    TooManyJobs,

    // =========================================================================
    // Server (500)
    // =========================================================================
    /// Anything that is our fault
    Internal,
}

impl ErrorKind {
    /// HTTP status sent on the wire
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidApiKey => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidJson
            | Self::InvalidPayload
            | Self::InvalidSlug
            | Self::MissingParameter
            | Self::InvalidArgument
            | Self::UrlRequired => StatusCode::BAD_REQUEST,
            Self::TooManyJobs => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Application-level code placed in `meta.code`
    pub fn meta_code(self) -> u16 {
        match self {
            Self::InvalidPayload => 4001,
            Self::InvalidSlug => 4002,
            other => other.status().as_u16(),
        }
    }

    /// Message used when the stage does not supply a more precise one
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::MethodNotAllowed => "Method not allowed",
            Self::InvalidApiKey => "Invalid API key",
            Self::PayloadTooLarge => "Payload too large",
            Self::UnsupportedMediaType => "Unsupported media type",
            Self::InvalidJson => "Invalid JSON",
            Self::InvalidPayload => "Invalid payload",
            Self::InvalidSlug => "Invalid slug",
            Self::MissingParameter => "Missing required parameter",
            Self::InvalidArgument => "Invalid argument",
            Self::UrlRequired => "'url' is required if start_requests are disabled",
            Self::TooManyJobs => "Too many requests",
            Self::Internal => "Internal error",
        }
    }

    /// Whether this is a 5xx row
    pub fn is_server_error(self) -> bool {
        self.status().is_server_error()
    }
}

/// A failure raised by any pipeline stage
///
/// Immutable once built. `status` and `meta_code` always come from the
/// taxonomy row; only the message can be refined by the raising stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {}, code {meta_code})", .status.as_u16())]
pub struct ApiError {
    kind: ErrorKind,
    status: StatusCode,
    meta_code: u16,
    message: String,
}

/// Result type used across the request pipeline
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Build the error for a taxonomy row with its default message
    pub fn new(kind: ErrorKind) -> Self {
        Self::with_message(kind, kind.default_message())
    }

    /// Build the error for a taxonomy row with a stage-specific message
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.status(),
            meta_code: kind.meta_code(),
            message: message.into(),
        }
    }

    /// `Missing required parameter: '<name>'`
    pub fn missing_parameter(name: &str) -> Self {
        Self::with_message(
            ErrorKind::MissingParameter,
            format!("Missing required parameter: '{}'", name),
        )
    }

    /// `'<key>' is not a valid argument`
    pub fn invalid_argument(key: &str) -> Self {
        Self::with_message(
            ErrorKind::InvalidArgument,
            format!("'{}' is not a valid argument", key),
        )
    }

    /// Generic 500; the cause is for server logs only
    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal)
    }

    /// Taxonomy row
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Application code for `meta.code`
    pub fn meta_code(&self) -> u16 {
        self.meta_code
    }

    /// Client-facing message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
