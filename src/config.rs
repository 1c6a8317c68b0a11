//! Gateway configuration
//!
//! Built once at startup and shared read-only. Sources, lowest to highest
//! precedence:
//!
//! 1. built-in defaults
//! 2. the TOML file passed with `--config`
//! 3. `-s/--set name=value` overrides (dotted names reach into tables)
//! 4. environment variables
//!
//! The API key is a secret and is read ONLY from `AFTERSHIP_COURIER_API_KEY`.
//!
//! ```toml
//! schema_path = "settings/schemas/request_schema.json"
//! max_jobs = 16
//! dispatch_timeout_secs = 120
//!
//! [engine]
//! program = "spider-runner"
//! args = ["--project", "couriers"]
//!
//! [[routes]]
//! path = "/trackings"
//! profile = "aftership"
//!
//! [[routes]]
//! path = "/crawl"
//! profile = "generic"
//! outcome_errors = "strict"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::engine::DEFAULT_UNKNOWN_TARGET_EXIT_CODE;
use crate::job::{BuildMode, UnknownArgPolicy};
use crate::render::OutcomeErrorMode;
use crate::request::DEFAULT_MAX_BODY_BYTES;
use crate::schema::DEFAULT_SCHEMA_PATH;

/// Env var holding the API key
pub const API_KEY_ENV: &str = "AFTERSHIP_COURIER_API_KEY";

/// Env var overriding the schema location
pub const SCHEMA_FILE_ENV: &str = "REQUEST_SCHEMA_FILE";

/// Default route
pub const DEFAULT_ROUTE: &str = "/trackings";

/// Default engine program
pub const DEFAULT_ENGINE_PROGRAM: &str = "spider-runner";

/// Configuration errors; all of them abort startup
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file or overrides do not deserialize
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// `AFTERSHIP_COURIER_API_KEY` unset or empty
    #[error("Environment variable AFTERSHIP_COURIER_API_KEY must be set")]
    MissingApiKey,

    /// A `--set` override is not `name=value`
    #[error("Invalid override '{0}', expected name=value")]
    InvalidOverride(String),

    /// Values parse but make no sense together
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Secret
// ============================================================================

/// A string that never shows up in debug output
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value. NEVER log this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Named bundle of per-resource behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProfile {
    /// Courier tracking API: wrapped payloads, strict outcome errors
    #[default]
    Aftership,
    /// Generic crawl API: raw payloads, permissive outcome errors, GET crawls
    Generic,
}

impl ResourceProfile {
    fn api_key_header(self) -> &'static str {
        match self {
            Self::Aftership => "aftership-courier-api-key",
            Self::Generic => "x-api-key",
        }
    }

    fn outcome_errors(self) -> OutcomeErrorMode {
        match self {
            Self::Aftership => OutcomeErrorMode::Strict,
            Self::Generic => OutcomeErrorMode::Permissive,
        }
    }

    fn build_mode(self) -> BuildMode {
        match self {
            Self::Aftership => BuildMode::Wrap,
            Self::Generic => BuildMode::Raw,
        }
    }
}

/// One mounted crawl resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Path the resource is mounted at
    pub path: String,
    /// Behavior bundle
    #[serde(default)]
    pub profile: ResourceProfile,
    /// Header carrying the API key (profile default when unset)
    #[serde(default)]
    pub api_key_header: Option<String>,
    /// Outcome-error mode (profile default when unset)
    #[serde(default)]
    pub outcome_errors: Option<OutcomeErrorMode>,
    /// Unknown fetch parameters on POST (rejected when unset)
    #[serde(default)]
    pub unknown_args: Option<UnknownArgPolicy>,
    /// Default engine request cap for jobs from this route
    #[serde(default)]
    pub max_requests: Option<u64>,
}

impl RouteConfig {
    /// Route with profile defaults
    pub fn new(path: impl Into<String>, profile: ResourceProfile) -> Self {
        Self {
            path: path.into(),
            profile,
            api_key_header: None,
            outcome_errors: None,
            unknown_args: None,
            max_requests: None,
        }
    }

    /// Header the API key is read from
    pub fn api_key_header(&self) -> Result<HeaderName, ConfigError> {
        let name = self
            .api_key_header
            .as_deref()
            .unwrap_or_else(|| self.profile.api_key_header());
        HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(|_| {
            ConfigError::Invalid(format!(
                "route {}: '{}' is not a valid header name",
                self.path, name
            ))
        })
    }

    /// Outcome-error mode in effect
    pub fn outcome_errors(&self) -> OutcomeErrorMode {
        self.outcome_errors
            .unwrap_or_else(|| self.profile.outcome_errors())
    }

    /// Unknown-argument policy for POST bodies
    pub fn unknown_args(&self) -> UnknownArgPolicy {
        self.unknown_args.unwrap_or(UnknownArgPolicy::Reject)
    }

    /// Payload shape accepted on POST
    pub fn build_mode(&self) -> BuildMode {
        self.profile.build_mode()
    }

    /// Whether GET with a query string starts a crawl
    pub fn query_crawl(&self) -> bool {
        self.profile == ResourceProfile::Generic
    }
}

// ============================================================================
// Engine
// ============================================================================

/// External engine program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Executable run once per job
    pub program: String,
    /// Arguments passed before the job is written to stdin
    pub args: Vec<String>,
    /// Exit code meaning "no such spider"
    pub unknown_target_exit_code: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENGINE_PROGRAM.to_string(),
            args: Vec::new(),
            unknown_target_exit_code: DEFAULT_UNKNOWN_TARGET_EXIT_CODE,
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// API secret; environment only
    #[serde(skip)]
    api_key: Secret,
    /// Request schema location
    pub schema_path: PathBuf,
    /// Largest accepted body
    pub max_body_bytes: usize,
    /// Concurrent job cap
    pub max_jobs: Option<usize>,
    /// Per-job timeout in seconds
    pub dispatch_timeout_secs: Option<u64>,
    /// Mounted crawl resources
    pub routes: Vec<RouteConfig>,
    /// Engine program
    pub engine: EngineConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: Secret::default(),
            schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_jobs: None,
            dispatch_timeout_secs: None,
            routes: vec![RouteConfig::new(DEFAULT_ROUTE, ResourceProfile::Aftership)],
            engine: EngineConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults with the given API key
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Secret::new(api_key),
            ..Self::default()
        }
    }

    /// Load from the process environment, an optional file and overrides
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed files, malformed overrides, a
    /// missing API key and inconsistent values.
    pub fn load(path: Option<&Path>, overrides: &[String]) -> Result<Self, ConfigError> {
        let content = path.map(std::fs::read_to_string).transpose()?;
        Self::resolve(content.as_deref(), overrides, |name| std::env::var(name).ok())
    }

    /// [`load`](Self::load) with the file already read and a custom env lookup
    pub fn resolve(
        content: Option<&str>,
        overrides: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut table = match content {
            Some(content) => content.parse::<toml::Table>()?,
            None => toml::Table::new(),
        };

        for raw in overrides {
            let (name, value) = parse_override(raw)?;
            apply_override(&mut table, &name, value)?;
        }

        let mut config: GatewayConfig = toml::Value::Table(table).try_into()?;

        if let Some(schema) = env(SCHEMA_FILE_ENV).filter(|v| !v.is_empty()) {
            config.schema_path = PathBuf::from(schema);
        }
        config.api_key = env(API_KEY_ENV)
            .filter(|v| !v.is_empty())
            .map(Secret::new)
            .ok_or(ConfigError::MissingApiKey)?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.expose().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("at least one route is required".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes must be positive".into()));
        }
        if self.engine.program.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.program must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            let base = route.path.trim_end_matches('/');
            if !route.path.starts_with('/') || base.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route path '{}' must start with '/' and name a resource",
                    route.path
                )));
            }
            if !seen.insert(base) {
                return Err(ConfigError::Invalid(format!(
                    "route path '{}' is configured twice",
                    route.path
                )));
            }
            route.api_key_header()?;
        }
        Ok(())
    }

    /// The API secret
    pub fn api_key(&self) -> &str {
        self.api_key.expose()
    }

    /// Per-job timeout
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs.map(Duration::from_secs)
    }

    /// Log the effective configuration, without the secret
    pub fn log_summary(&self) {
        info!(
            schema_path = %self.schema_path.display(),
            max_body_bytes = self.max_body_bytes,
            max_jobs = ?self.max_jobs,
            dispatch_timeout_secs = ?self.dispatch_timeout_secs,
            engine = %self.engine.program,
            "Gateway configuration loaded"
        );
        for route in &self.routes {
            info!(
                path = %route.path,
                profile = ?route.profile,
                build_mode = ?route.build_mode(),
                outcome_errors = %route.outcome_errors(),
                unknown_args = ?route.unknown_args(),
                query_crawl = route.query_crawl(),
                "Crawl resource mode"
            );
        }
    }
}

/// Split `name=value`; the value is a TOML literal or, failing that, a string
fn parse_override(raw: &str) -> Result<(String, toml::Value), ConfigError> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    }

    let value = value.trim();
    let parsed = format!("v = {}", value)
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((name.to_ascii_lowercase(), parsed))
}

fn apply_override(
    table: &mut toml::Table,
    name: &str,
    value: toml::Value,
) -> Result<(), ConfigError> {
    let mut parts: Vec<&str> = name.split('.').collect();
    let last = parts.pop().unwrap_or(name);

    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()));
        current = entry.as_table_mut().ok_or_else(|| {
            ConfigError::InvalidOverride(format!("{} ('{}' is not a table)", name, part))
        })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}
