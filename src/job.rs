//! Job specification building
//!
//! Maps a validated payload onto an engine-agnostic [`JobSpec`]. Two payload
//! shapes are understood:
//!
//! - **wrap**: the courier tracking payload `{slug, tracking_queries}`. The
//!   target is `slug + "spider"`, the whole payload travels as the fetch
//!   `meta`, de-duplication is disabled and the job starts without a fetch.
//! - **raw**: the generic crawl payload
//!   `{spider_name, request: {url, ...}, start_requests, max_requests}`.
//!
//! Wrap mode rewrites its payload into the raw shape and then follows the
//! same path, so both modes share one set of checks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ApiError, ApiResult, ErrorKind};

/// Fetch parameters the engine's request constructor accepts
pub const FETCH_ARGUMENTS: &[&str] = &[
    "url",
    "callback",
    "method",
    "headers",
    "body",
    "cookies",
    "meta",
    "encoding",
    "priority",
    "dont_filter",
    "errback",
    "flags",
    "cb_kwargs",
];

/// Suffix appended to a courier slug to name its spider
pub const SPIDER_SUFFIX: &str = "spider";

/// Normalized description of one crawl task
///
/// Never mutated after the builder hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Spider (job target) name, never empty
    pub target_id: String,
    /// Fetch parameters, restricted to [`FETCH_ARGUMENTS`]
    pub fetch_params: Map<String, Value>,
    /// Let the spider issue its own start requests instead of fetching `url`
    pub start_without_fetch: bool,
    /// Engine-side cap on requests made by this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    /// Caller data forwarded to the spider so results can be correlated
    #[serde(default)]
    pub correlation_meta: Map<String, Value>,
}

/// Payload shape a resource accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Courier tracking payload, wrapped into a crawl request
    Wrap,
    /// Generic crawl payload, used as-is
    Raw,
}

/// What to do with fetch parameters the engine does not recognize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownArgPolicy {
    /// Abort on the first unrecognized key
    Reject,
    /// Drop unrecognized keys silently
    Drop,
}

/// Builds [`JobSpec`]s for one resource
#[derive(Debug, Clone, Default)]
pub struct JobSpecBuilder {
    default_max_requests: Option<u64>,
}

impl JobSpecBuilder {
    /// Builder with no default request cap
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap applied when the payload does not carry `max_requests`
    pub fn with_default_max_requests(mut self, max_requests: Option<u64>) -> Self {
        self.default_max_requests = max_requests;
        self
    }

    /// Build a job from a decoded payload
    pub fn build(
        &self,
        payload: &Map<String, Value>,
        mode: BuildMode,
        policy: UnknownArgPolicy,
    ) -> ApiResult<JobSpec> {
        match mode {
            BuildMode::Wrap => self.build_raw(&wrap_tracking_payload(payload)?, policy),
            BuildMode::Raw => self.build_raw(payload, policy),
        }
    }

    /// Build a job from query-string parameters
    ///
    /// `spider_name`, `start_requests` and `max_requests` are API parameters;
    /// every other key is a fetch parameter.
    pub fn build_from_query(
        &self,
        query: &HashMap<String, String>,
        policy: UnknownArgPolicy,
    ) -> ApiResult<JobSpec> {
        let mut api_params = Map::new();
        let mut request = Map::new();

        for (key, value) in query {
            match key.as_str() {
                "spider_name" => {
                    api_params.insert(key.clone(), Value::String(value.clone()));
                }
                "start_requests" => {
                    let flag = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
                    api_params.insert(key.clone(), Value::Bool(flag));
                }
                "max_requests" => {
                    let parsed = value
                        .parse::<u64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::String(value.clone()));
                    api_params.insert(key.clone(), parsed);
                }
                _ => {
                    request.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }
        api_params.insert("request".to_string(), Value::Object(request));

        self.build_raw(&api_params, policy)
    }

    fn build_raw(
        &self,
        api_params: &Map<String, Value>,
        policy: UnknownArgPolicy,
    ) -> ApiResult<JobSpec> {
        let request = match api_params.get("request") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ApiError::with_message(
                    ErrorKind::InvalidArgument,
                    "'request' must be an object",
                ))
            }
        };
        let fetch_params = filter_fetch_params(&request, policy)?;

        let target_id = get_required(api_params, "spider_name")?
            .as_str()
            .ok_or_else(|| {
                ApiError::with_message(ErrorKind::InvalidArgument, "'spider_name' must be a string")
            })?
            .to_string();

        let start_without_fetch = api_params
            .get("start_requests")
            .map(is_truthy)
            .unwrap_or(false);

        validate_fetch_target(&fetch_params, start_without_fetch)?;

        let max_requests = match api_params.get("max_requests") {
            None | Some(Value::Null) => self.default_max_requests,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                ApiError::with_message(
                    ErrorKind::InvalidArgument,
                    "'max_requests' must be a non-negative integer",
                )
            })?),
        };

        let correlation_meta = match fetch_params.get("meta") {
            Some(Value::Object(meta)) => meta.clone(),
            _ => Map::new(),
        };

        debug!(
            target_id = %target_id,
            start_without_fetch,
            max_requests = ?max_requests,
            "Built job spec"
        );

        Ok(JobSpec {
            target_id,
            fetch_params,
            start_without_fetch,
            max_requests,
            correlation_meta,
        })
    }
}

/// Rewrite a courier tracking payload into the generic crawl shape
///
/// `{slug, ...}` becomes
/// `{spider_name: slug + "spider", start_requests: true,
///   request: {meta: <payload>, dont_filter: true}}`.
pub fn wrap_tracking_payload(payload: &Map<String, Value>) -> ApiResult<Map<String, Value>> {
    let slug = get_required(payload, "slug")?
        .as_str()
        .ok_or_else(|| ApiError::new(ErrorKind::InvalidSlug))?;

    let mut request = Map::new();
    request.insert("meta".to_string(), Value::Object(payload.clone()));
    request.insert("dont_filter".to_string(), Value::Bool(true));

    let mut wrapped = Map::new();
    wrapped.insert("request".to_string(), Value::Object(request));
    wrapped.insert("start_requests".to_string(), Value::Bool(true));
    wrapped.insert(
        "spider_name".to_string(),
        Value::String(format!("{}{}", slug, SPIDER_SUFFIX)),
    );
    Ok(wrapped)
}

/// Fetch a required field; absent and falsy values are both missing
pub fn get_required<'a>(map: &'a Map<String, Value>, name: &str) -> ApiResult<&'a Value> {
    match map.get(name) {
        Some(value) if is_truthy(value) => Ok(value),
        _ => Err(ApiError::missing_parameter(name)),
    }
}

/// Keep only recognized fetch parameters
pub fn filter_fetch_params(
    request: &Map<String, Value>,
    policy: UnknownArgPolicy,
) -> ApiResult<Map<String, Value>> {
    let mut filtered = Map::new();
    for (key, value) in request {
        if FETCH_ARGUMENTS.contains(&key.as_str()) {
            filtered.insert(key.clone(), value.clone());
            continue;
        }
        match policy {
            UnknownArgPolicy::Reject => return Err(ApiError::invalid_argument(key)),
            UnknownArgPolicy::Drop => debug!(key = %key, "Dropping unknown fetch parameter"),
        }
    }
    Ok(filtered)
}

/// A job needs a URL to fetch unless the spider starts on its own
pub fn validate_fetch_target(
    fetch_params: &Map<String, Value>,
    start_without_fetch: bool,
) -> ApiResult<()> {
    let has_url = fetch_params.get("url").map(is_truthy).unwrap_or(false);
    if has_url || start_without_fetch {
        Ok(())
    } else {
        Err(ApiError::new(ErrorKind::UrlRequired))
    }
}

/// JSON truthiness: null, false, 0, "" and empty containers are falsy
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
