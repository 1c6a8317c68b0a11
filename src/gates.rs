//! Admission gates
//!
//! Header checks that run before any payload inspection: the API key first,
//! then the content type. An unauthenticated caller never learns anything
//! about why its body would have been rejected.

use tracing::warn;

use crate::error::{ApiError, ApiResult, ErrorKind};

/// The only content type accepted on crawl submissions
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Checks a caller-supplied API key against the configured secret
#[derive(Clone)]
pub struct AuthGate {
    expected: String,
}

impl AuthGate {
    /// Create a gate for `expected`
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    /// Fails with 403 when the key is absent or does not match exactly
    pub fn check(&self, api_key: Option<&str>) -> ApiResult<()> {
        match api_key {
            Some(key) if constant_time_eq(key, &self.expected) => Ok(()),
            Some(_) => {
                warn!("Rejected request with wrong API key");
                Err(ApiError::new(ErrorKind::InvalidApiKey))
            }
            None => {
                warn!("Rejected request without API key");
                Err(ApiError::new(ErrorKind::InvalidApiKey))
            }
        }
    }
}

// Keep the secret out of debug output.
impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

/// Checks that the body was declared as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTypeGate;

impl ContentTypeGate {
    /// Fails with 415 unless the header is exactly `application/json`
    pub fn check(content_type: Option<&str>) -> ApiResult<()> {
        match content_type {
            Some(JSON_CONTENT_TYPE) => Ok(()),
            other => {
                warn!(content_type = ?other, "Rejected unsupported media type");
                Err(ApiError::new(ErrorKind::UnsupportedMediaType))
            }
        }
    }
}

/// Comparison whose duration does not depend on where the inputs differ
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
