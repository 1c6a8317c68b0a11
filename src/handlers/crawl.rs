//! Crawl resource
//!
//! One [`CrawlResource`] is mounted per configured route. POST runs the full
//! pipeline, strictly in this order, and the first failing stage decides the
//! response:
//!
//! 1. body size (413)
//! 2. API key (403)
//! 3. content type (415)
//! 4. JSON object (400 `Invalid JSON`)
//! 5. schema (400/4001)
//! 6. job spec (400)
//! 7. dispatch (429, 400/4002, 500)
//! 8. outcome classification (strict or permissive)
//!
//! GET is a health check. On `generic` routes a GET with a query string
//! starts a crawl instead; unknown fetch parameters are then dropped.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::config::{ConfigError, GatewayConfig, RouteConfig};
use crate::dispatch::CrawlDispatcher;
use crate::engine::JobOutcome;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::gates::{AuthGate, ContentTypeGate};
use crate::job::{BuildMode, JobSpecBuilder, UnknownArgPolicy};
use crate::render::{ResponseRenderer, CRAWL_RESOURCE_METHODS};
use crate::request::{request_context, ParsedRequest, RawRequest, RequestParser};
use crate::schema::SchemaValidator;

/// Everything one mounted route needs to serve requests
#[derive(Debug)]
pub struct CrawlResource {
    route: String,
    parser: RequestParser,
    auth: AuthGate,
    schema: Arc<SchemaValidator>,
    builder: JobSpecBuilder,
    build_mode: BuildMode,
    unknown_args: UnknownArgPolicy,
    query_crawl: bool,
    dispatcher: CrawlDispatcher,
    renderer: ResponseRenderer,
    max_body_bytes: usize,
}

impl CrawlResource {
    /// Resource for `route`
    pub fn new(
        route: &RouteConfig,
        config: &GatewayConfig,
        schema: Arc<SchemaValidator>,
        dispatcher: CrawlDispatcher,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            route: route.path.clone(),
            parser: RequestParser::new(route.api_key_header()?),
            auth: AuthGate::new(config.api_key()),
            schema,
            builder: JobSpecBuilder::new().with_default_max_requests(route.max_requests),
            build_mode: route.build_mode(),
            unknown_args: route.unknown_args(),
            query_crawl: route.query_crawl(),
            dispatcher,
            renderer: ResponseRenderer::new(CRAWL_RESOURCE_METHODS, route.outcome_errors()),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Mount path
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Run the POST pipeline
    #[instrument(skip_all, fields(route = %self.route))]
    pub async fn post(&self, method: Method, headers: HeaderMap, body: Body) -> Response {
        self.parser.log_headers(&method, &headers);
        let raw = match RawRequest::read(method, headers, body, self.max_body_bytes).await {
            Ok(raw) => raw,
            Err(err) => return self.finish(Err(err), &Value::Object(Map::new())),
        };

        let parsed = self.parser.parse(&raw);
        let result = self.submit_parsed(&parsed).await;
        self.finish(result, &parsed.context)
    }

    async fn submit_parsed(&self, parsed: &ParsedRequest) -> ApiResult<JobOutcome> {
        self.auth.check(parsed.api_key.as_deref())?;
        ContentTypeGate::check(parsed.content_type.as_deref())?;
        self.schema.validate(&parsed.payload)?;

        let payload = parsed
            .payload
            .as_mapping()
            .ok_or_else(|| ApiError::new(ErrorKind::InvalidJson))?;
        let job = self
            .builder
            .build(payload, self.build_mode, self.unknown_args)?;

        self.dispatcher.submit(job).await
    }

    /// Health check, or a query-string crawl on routes that allow it
    #[instrument(skip_all, fields(route = %self.route))]
    pub async fn get(&self, headers: &HeaderMap, query: HashMap<String, String>) -> Response {
        if !self.query_crawl || query.is_empty() {
            debug!("Health check");
            return self.count(self.renderer.respond_health());
        }

        self.parser.log_headers(&Method::GET, headers);
        let context = Value::Object(
            query
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        let api_key = headers
            .get(self.parser.api_key_header())
            .and_then(|v| v.to_str().ok());

        let result = self.submit_query(api_key, &query).await;
        self.finish(result, &context)
    }

    async fn submit_query(
        &self,
        api_key: Option<&str>,
        query: &HashMap<String, String>,
    ) -> ApiResult<JobOutcome> {
        self.auth.check(api_key)?;
        let job = self
            .builder
            .build_from_query(query, UnknownArgPolicy::Drop)?;
        self.dispatcher.submit(job).await
    }

    /// 405 for methods the resource does not declare
    pub async fn method_not_allowed(&self, method: &Method, body: Body) -> Response {
        debug!(route = %self.route, method = %method, "Method not allowed");
        let context = buffered_context(body, self.max_body_bytes).await;
        self.finish(Err(ApiError::new(ErrorKind::MethodNotAllowed)), &context)
    }

    fn finish(&self, result: ApiResult<JobOutcome>, context: &Value) -> Response {
        self.count(self.renderer.respond(result, context))
    }

    fn count(&self, response: Response) -> Response {
        record_request(&self.route, response.status());
        response
    }
}

/// Count a rendered response
pub(crate) fn record_request(route: &str, status: StatusCode) {
    counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "code" => status.as_u16().to_string()
    )
    .increment(1);
}

/// Request context for bodies nobody validates; oversized bodies echo nothing
pub(crate) async fn buffered_context(body: Body, limit: usize) -> Value {
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => request_context(&bytes),
        Err(_) => Value::Object(Map::new()),
    }
}

// ============================================================================
// Axum handlers
// ============================================================================

/// `POST <route>`
pub async fn crawl_post(State(resource): State<Arc<CrawlResource>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    resource.post(parts.method, parts.headers, body).await
}

/// `GET <route>`
pub async fn crawl_get(
    State(resource): State<Arc<CrawlResource>>,
    headers: HeaderMap,
    query: Option<Query<HashMap<String, String>>>,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    resource.get(&headers, query).await
}

/// Any other method on `<route>`
pub async fn crawl_method_not_allowed(
    State(resource): State<Arc<CrawlResource>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    resource.method_not_allowed(&parts.method, body).await
}
