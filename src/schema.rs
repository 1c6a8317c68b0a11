//! Request schema validation
//!
//! Wraps a compiled JSON Schema loaded once at startup. Validation is a pure
//! function of the payload: the same payload always yields the same result.
//!
//! When no schema file exists the validator is disabled and every decoded
//! object passes. Startup logs a warning in that case.

use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::request::DecodedPayload;

/// Default location of the request schema
pub const DEFAULT_SCHEMA_PATH: &str = "settings/schemas/request_schema.json";

/// How many violations to log for one rejected payload
const MAX_LOGGED_VIOLATIONS: usize = 5;

/// Errors raised while loading a schema
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Schema file exists but could not be read
    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    /// Schema file is not JSON
    #[error("Schema file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema is JSON but not a usable JSON Schema
    #[error("Invalid JSON Schema: {0}")]
    Invalid(String),
}

/// Validates decoded payloads against an optional JSON Schema
#[derive(Debug, Default)]
pub struct SchemaValidator {
    validator: Option<jsonschema::Validator>,
}

impl SchemaValidator {
    /// Validator that accepts every JSON object
    pub fn disabled() -> Self {
        Self { validator: None }
    }

    /// Compile a schema document
    pub fn from_value(schema: &Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| SchemaError::Invalid(e.to_string()))?;
        Ok(Self {
            validator: Some(validator),
        })
    }

    /// Load the schema at `path`; a missing file disables validation
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        if !path.is_file() {
            warn!(
                path = %path.display(),
                "Request schema file not found, schema validation disabled"
            );
            return Ok(Self::disabled());
        }

        let content = std::fs::read_to_string(path)?;
        let schema: Value = serde_json::from_str(&content)?;
        let validator = Self::from_value(&schema)?;
        info!(path = %path.display(), "Loaded request schema");
        Ok(validator)
    }

    /// Whether a schema is loaded
    pub fn is_enabled(&self) -> bool {
        self.validator.is_some()
    }

    /// Validate a decoded payload
    ///
    /// # Errors
    ///
    /// - 400/400 `Invalid JSON` when the body did not decode to an object
    /// - 400/4001 `Invalid payload` when the object violates the schema
    pub fn validate(&self, payload: &DecodedPayload) -> ApiResult<()> {
        match payload {
            DecodedPayload::Malformed => Err(ApiError::new(ErrorKind::InvalidJson)),
            DecodedPayload::Mapping(map) => self.validate_mapping(map),
        }
    }

    /// Validate an already-decoded object
    pub fn validate_mapping(&self, map: &Map<String, Value>) -> ApiResult<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };

        let instance = Value::Object(map.clone());
        if validator.is_valid(&instance) {
            return Ok(());
        }

        for violation in validator.iter_errors(&instance).take(MAX_LOGGED_VIOLATIONS) {
            debug!(
                path = %violation.instance_path,
                violation = %violation,
                "Schema violation"
            );
        }
        Err(ApiError::new(ErrorKind::InvalidPayload))
    }
}
