//! Inbound request decoding
//!
//! Turns the method, headers and body of an HTTP request into a
//! [`ParsedRequest`]: the decoded payload (or a marker that decoding failed),
//! the headers later stages need, and the request context echoed back in
//! error envelopes. Parsing never fails past this boundary; classifying a
//! missing header or a malformed body is left to the stages that care.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderName, Method},
};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult, ErrorKind};

/// Default maximum body size in bytes (1 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Placeholder logged instead of the API key value
const REDACTED: &str = "[redacted]";

// ============================================================================
// Raw Request
// ============================================================================

/// An inbound request as received, before any interpretation
#[derive(Debug, Clone)]
pub struct RawRequest {
    method: Method,
    headers: HeaderMap,
    body: Bytes,
}

impl RawRequest {
    /// Wrap an already-buffered request
    pub fn new(method: Method, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            headers,
            body: body.into(),
        }
    }

    /// Buffer a streaming body, enforcing `max_body_bytes`
    ///
    /// # Errors
    ///
    /// Returns a 413 [`ApiError`] when the declared or actual body length
    /// exceeds the limit.
    pub async fn read(
        method: Method,
        headers: HeaderMap,
        body: Body,
        max_body_bytes: usize,
    ) -> ApiResult<Self> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        if let Some(len) = declared {
            if len > max_body_bytes {
                warn!(
                    declared = len,
                    limit = max_body_bytes,
                    "Rejecting body larger than limit"
                );
                return Err(ApiError::new(ErrorKind::PayloadTooLarge));
            }
        }

        let body = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(|e| {
                warn!(error = %e, limit = max_body_bytes, "Failed to buffer request body");
                ApiError::new(ErrorKind::PayloadTooLarge)
            })?;

        Ok(Self::new(method, headers, body))
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Header map; lookups are case-insensitive
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Single header value as a string, `None` when absent or not visible ASCII
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// ============================================================================
// Decoded Payload
// ============================================================================

/// Result of decoding the body
///
/// Either a complete JSON object or a marker; never partially decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// Body decoded to a JSON object
    Mapping(Map<String, Value>),
    /// Body was empty, not UTF-8 JSON, or JSON that is not an object
    Malformed,
}

impl DecodedPayload {
    /// The mapping, if decoding succeeded
    pub fn as_mapping(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Mapping(map) => Some(map),
            Self::Malformed => None,
        }
    }
}

/// Everything later stages need from a request
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Decoded body
    pub payload: DecodedPayload,
    /// `content-type` header, verbatim
    pub content_type: Option<String>,
    /// Caller-supplied API key
    pub api_key: Option<String>,
    /// What the caller sent, echoed in error envelopes
    pub context: Value,
}

impl ParsedRequest {
    /// Request with nothing usable in it
    pub fn empty() -> Self {
        Self {
            payload: DecodedPayload::Malformed,
            content_type: None,
            api_key: None,
            context: Value::Object(Map::new()),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Decodes raw requests for one resource
#[derive(Debug, Clone)]
pub struct RequestParser {
    api_key_header: HeaderName,
}

impl RequestParser {
    /// Create a parser that reads the API key from `api_key_header`
    pub fn new(api_key_header: HeaderName) -> Self {
        Self { api_key_header }
    }

    /// Header the API key is read from
    pub fn api_key_header(&self) -> &HeaderName {
        &self.api_key_header
    }

    /// Log the header set of an inbound request, API key redacted
    ///
    /// Runs before the body is read so that requests rejected for size are
    /// logged too.
    pub fn log_headers(&self, method: &Method, headers: &HeaderMap) {
        info!(
            method = %method,
            api_headers = ?self.loggable_headers(headers),
            "Received API request"
        );
    }

    /// Decode a raw request
    ///
    /// Logs the decoded-or-raw payload before any validation runs.
    pub fn parse(&self, raw: &RawRequest) -> ParsedRequest {
        let payload = match serde_json::from_slice::<Value>(raw.body()) {
            Ok(Value::Object(map)) => DecodedPayload::Mapping(map),
            _ => DecodedPayload::Malformed,
        };
        let context = request_context(raw.body());

        info!(api_params = %context, "Decoded API payload");

        ParsedRequest {
            payload,
            content_type: raw.header(&header::CONTENT_TYPE).map(str::to_string),
            api_key: raw.header(&self.api_key_header).map(str::to_string),
            context,
        }
    }

    fn loggable_headers(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if *name == self.api_key_header {
                    REDACTED.to_string()
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                (name.as_str().to_string(), value)
            })
            .collect()
    }
}

/// What the caller sent, in the form echoed back in envelopes
///
/// The decoded JSON value when the body is JSON, the raw text otherwise,
/// and an empty object for an empty body.
pub fn request_context(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}
