//! End-to-end tests for the gateway router
//!
//! Drives the full router (layers included) with `oneshot` against a
//! scripted in-memory engine that records every job it receives.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use courier_gateway::{
    config::{GatewayConfig, ResourceProfile, RouteConfig},
    dispatch::CrawlDispatcher,
    engine::{CrawlEngine, EngineError, JobOutcome},
    handlers::gateway_router,
    job::JobSpec,
    render::Envelope,
    schema::SchemaValidator,
};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt;

const API_KEY: &str = "aftership-spider-team";
const TRACKING_BODY: &str =
    r#"{"slug":"aftership","tracking_queries":[{"tracking_number":"YT1802927571800445"}]}"#;

// ============================================================================
// Harness
// ============================================================================

/// What the scripted engine does with a job
#[derive(Clone)]
enum Script {
    /// Return one item per job echoing the target
    Items,
    /// Return items and spider errors
    ItemsWithErrors(Vec<Value>),
    /// Block until released
    Gated(Arc<Notify>),
    /// Panic inside the engine
    Panic,
}

struct ScriptedEngine {
    script: Script,
    jobs: Mutex<Vec<JobSpec>>,
}

impl ScriptedEngine {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            jobs: Mutex::new(Vec::new()),
        })
    }

    fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrawlEngine for ScriptedEngine {
    async fn crawl(&self, job: JobSpec) -> Result<JobOutcome, EngineError> {
        self.jobs.lock().unwrap().push(job.clone());

        if job.target_id == "nosuchcourierspider" {
            return Err(EngineError::UnknownTarget(job.target_id));
        }

        let item = json!({ "spider": job.target_id, "meta": job.correlation_meta });
        match &self.script {
            Script::Items => Ok(JobOutcome::with_items(vec![item])),
            Script::ItemsWithErrors(errors) => Ok(JobOutcome {
                items: vec![item],
                errors: errors.clone(),
            }),
            Script::Gated(release) => {
                release.notified().await;
                Ok(JobOutcome::with_items(vec![item]))
            }
            Script::Panic => panic!("engine blew up"),
        }
    }
}

fn tracking_schema() -> Arc<SchemaValidator> {
    let schema: Value =
        serde_json::from_str(include_str!("../settings/schemas/request_schema.json")).unwrap();
    Arc::new(SchemaValidator::from_value(&schema).unwrap())
}

fn app_with(config: GatewayConfig, engine: Arc<ScriptedEngine>) -> Router {
    let dispatcher = CrawlDispatcher::new(engine).with_max_jobs(config.max_jobs);
    gateway_router(&config, tracking_schema(), dispatcher).unwrap()
}

fn app(engine: Arc<ScriptedEngine>) -> Router {
    app_with(GatewayConfig::with_api_key(API_KEY), engine)
}

fn generic_config() -> GatewayConfig {
    let mut config = GatewayConfig::with_api_key(API_KEY);
    config
        .routes
        .push(RouteConfig::new("/crawl", ResourceProfile::Generic));
    config
}

fn post(uri: &str, key: Option<&str>, content_type: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method(Method::POST).uri(uri);
    if let Some(key) = key {
        builder = builder.header("aftership-courier-api-key", key);
    }
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn tracking_post(body: &str) -> Request<Body> {
    post("/trackings", Some(API_KEY), Some("application/json"), body)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Envelope) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.ends_with(b"\n"), "body must be newline terminated");
    (status, serde_json::from_slice(&body).unwrap())
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_valid_tracking_request_dispatches_spider() {
    let engine = ScriptedEngine::new(Script::Items);
    let (status, envelope) = send(app(engine.clone()), tracking_post(TRACKING_BODY)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.meta.message, "OK");
    assert_eq!(envelope.meta.code, 200);

    let jobs = engine.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].target_id, "aftershipspider");
    assert!(jobs[0].start_without_fetch);
    assert_eq!(jobs[0].fetch_params["dont_filter"], json!(true));
    assert_eq!(
        Value::Object(jobs[0].correlation_meta.clone()),
        serde_json::from_str::<Value>(TRACKING_BODY).unwrap()
    );

    assert_eq!(envelope.data["trackings"][0]["spider"], json!("aftershipspider"));
}

#[tokio::test]
async fn test_other_courier_slug() {
    let engine = ScriptedEngine::new(Script::Items);
    let body = r#"{"slug":"yunexpress","tracking_queries":[{"tracking_number":"YT1802927571800445"}]}"#;
    let (status, _) = send(app(engine.clone()), tracking_post(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(engine.jobs()[0].target_id, "yunexpressspider");
}

#[tokio::test]
async fn test_health_check() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = Request::builder()
        .uri("/trackings")
        .body(Body::empty())
        .unwrap();
    let (status, envelope) = send(app(engine.clone()), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.meta.message, "OK");
    assert_eq!(envelope.data, json!({}));
    assert!(engine.jobs().is_empty());
}

#[tokio::test]
async fn test_response_headers() {
    let engine = ScriptedEngine::new(Script::Items);
    let response = app(engine).oneshot(tracking_post(TRACKING_BODY)).await.unwrap();
    let headers = response.headers();

    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "GET, POST");
    assert_eq!(headers["access-control-allow-headers"], "X-Requested-With");
    assert_eq!(headers["content-type"], "application/json");
    assert!(headers.contains_key("x-request-id"));

    let declared: usize = headers["content-length"].to_str().unwrap().parse().unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(declared, body.len());
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_wrong_api_key() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = post(
        "/trackings",
        Some("aftership-spider-xxxx"),
        Some("application/json"),
        TRACKING_BODY,
    );
    let (status, envelope) = send(app(engine.clone()), request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(envelope.meta.message, "Invalid API key");
    assert_eq!(envelope.meta.code, 403);
    assert!(engine.jobs().is_empty());
}

#[tokio::test]
async fn test_missing_api_key_beats_every_body_problem() {
    for (content_type, body) in [
        (Some("application/json"), TRACKING_BODY),
        (Some("text/html"), "<html></html>"),
        (None, r#"{"slug":"x""#),
        (Some("application/json"), r#"{"slug":"aftership","tracking_querie":[]}"#),
    ] {
        let engine = ScriptedEngine::new(Script::Items);
        let (status, envelope) =
            send(app(engine), post("/trackings", None, content_type, body)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(envelope.meta.message, "Invalid API key");
    }
}

#[tokio::test]
async fn test_wrong_content_type() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = post("/trackings", Some(API_KEY), Some("text/plain"), TRACKING_BODY);
    let (status, envelope) = send(app(engine), request).await;

    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(envelope.meta.message, "Unsupported media type");
    assert_eq!(envelope.meta.code, 415);
    assert_eq!(envelope.data, json!({}));
}

#[tokio::test]
async fn test_payload_too_large() {
    let mut config = GatewayConfig::with_api_key(API_KEY);
    config.max_body_bytes = 64;
    let engine = ScriptedEngine::new(Script::Items);
    let big = format!(r#"{{"slug":"aftership","pad":"{}"}}"#, "x".repeat(256));

    let (status, envelope) = send(app_with(config, engine), tracking_post(&big)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(envelope.meta.code, 413);
    assert_eq!(envelope.data, json!({}));
}

// ============================================================================
// Payload
// ============================================================================

#[tokio::test]
async fn test_malformed_json() {
    let engine = ScriptedEngine::new(Script::Items);
    let (status, envelope) = send(app(engine), tracking_post(r#"{"slug":"x""#)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope.meta.code, 400);
    assert_eq!(envelope.meta.message, "Invalid JSON");
    assert_eq!(envelope.data, json!({}));
}

#[tokio::test]
async fn test_schema_violation() {
    let engine = ScriptedEngine::new(Script::Items);
    let body = r#"{"slug":"aftership","tracking_querie":[{"tracking_number":"YT1802927571800445"}]}"#;
    let (status, envelope) = send(app(engine.clone()), tracking_post(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope.meta.code, 4001);
    assert_eq!(envelope.meta.message, "Invalid payload");
    assert_eq!(envelope.data, serde_json::from_str::<Value>(body).unwrap());
    assert!(engine.jobs().is_empty());
}

#[tokio::test]
async fn test_unknown_slug() {
    let engine = ScriptedEngine::new(Script::Items);
    let body = r#"{"slug":"nosuchcourier","tracking_queries":[{"tracking_number":"1"}]}"#;
    let (status, envelope) = send(app(engine.clone()), tracking_post(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope.meta.code, 4002);
    assert_eq!(envelope.meta.message, "Invalid slug");
    assert_eq!(engine.jobs().len(), 1);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_trailing_slash_reaches_resource() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = post("/trackings/", Some(API_KEY), Some("application/json"), TRACKING_BODY);
    let (status, envelope) = send(app(engine.clone()), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.meta.code, 200);
    assert_eq!(engine.jobs()[0].target_id, "aftershipspider");

    let health = Request::builder()
        .uri("/trackings/")
        .body(Body::empty())
        .unwrap();
    let (status, envelope) = send(app(engine), health).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope.data, json!({}));
}

#[tokio::test]
async fn test_unknown_route() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = post("/tracking", Some(API_KEY), Some("application/json"), TRACKING_BODY);
    let (status, envelope) = send(app(engine), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(envelope.meta.message, "Not found");
    assert_eq!(envelope.meta.code, 404);
    assert_eq!(envelope.data, serde_json::from_str::<Value>(TRACKING_BODY).unwrap());
}

#[tokio::test]
async fn test_method_not_allowed() {
    let engine = ScriptedEngine::new(Script::Items);
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/trackings")
        .body(Body::empty())
        .unwrap();
    let (status, envelope) = send(app(engine), request).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(envelope.meta.code, 405);
}

// ============================================================================
// Dispatch and outcome
// ============================================================================

#[tokio::test]
async fn test_strict_outcome_errors_become_500() {
    let engine = ScriptedEngine::new(Script::ItemsWithErrors(vec![json!(
        "Traceback (most recent call last): ..."
    )]));
    let (status, envelope) = send(app(engine), tracking_post(TRACKING_BODY)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(envelope.meta.message, "Internal error");
    assert_eq!(envelope.meta.code, 500);
    assert_eq!(
        envelope.data,
        json!({"status": {"message": "Processing Failed", "code": 500}})
    );
}

#[tokio::test]
async fn test_permissive_outcome_errors_pass_through() {
    let engine = ScriptedEngine::new(Script::ItemsWithErrors(vec![
        json!("page 2 failed"),
        json!({"type": "HttpError", "url": "https://example.com/2", "status": 503}),
    ]));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/crawl")
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"spider_name":"blogspider","request":{"url":"https://example.com"}}"#,
        ))
        .unwrap();

    // The tracking schema only guards /trackings-shaped bodies, so run
    // the generic route without one.
    let config = generic_config();
    let dispatcher = CrawlDispatcher::new(engine.clone());
    let app = gateway_router(&config, Arc::new(SchemaValidator::disabled()), dispatcher).unwrap();

    let (status, envelope) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        envelope.data["errors"],
        json!([
            "page 2 failed",
            {"type": "HttpError", "url": "https://example.com/2", "status": 503}
        ])
    );
    assert_eq!(envelope.data["trackings"][0]["spider"], json!("blogspider"));
    assert_eq!(engine.jobs()[0].fetch_params["url"], json!("https://example.com"));
}

#[tokio::test]
async fn test_generic_post_rejects_unknown_argument() {
    let engine = ScriptedEngine::new(Script::Items);
    let config = generic_config();
    let app = gateway_router(
        &config,
        Arc::new(SchemaValidator::disabled()),
        CrawlDispatcher::new(engine.clone()),
    )
    .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/crawl")
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"spider_name":"blogspider","request":{"url":"https://example.com","foo":1}}"#,
        ))
        .unwrap();

    let (status, envelope) = send(app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope.meta.message, "'foo' is not a valid argument");
    assert!(engine.jobs().is_empty());
}

#[tokio::test]
async fn test_generic_post_requires_url_or_start_requests() {
    let engine = ScriptedEngine::new(Script::Items);
    let config = generic_config();
    let app = gateway_router(
        &config,
        Arc::new(SchemaValidator::disabled()),
        CrawlDispatcher::new(engine),
    )
    .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/crawl")
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"spider_name":"blogspider","request":{}}"#))
        .unwrap();

    let (status, envelope) = send(app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        envelope.meta.message,
        "'url' is required if start_requests are disabled"
    );
}

#[tokio::test]
async fn test_generic_get_crawls_from_query() {
    let engine = ScriptedEngine::new(Script::Items);
    let config = generic_config();
    let app = gateway_router(
        &config,
        Arc::new(SchemaValidator::disabled()),
        CrawlDispatcher::new(engine.clone()),
    )
    .unwrap();

    let request = Request::builder()
        .uri("/crawl?spider_name=blogspider&url=https%3A%2F%2Fexample.com&utm_source=feed")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);

    let jobs = engine.jobs();
    assert_eq!(jobs[0].target_id, "blogspider");
    assert_eq!(jobs[0].fetch_params["url"], json!("https://example.com"));
    assert!(!jobs[0].fetch_params.contains_key("utm_source"));
}

#[tokio::test]
async fn test_job_cap_rejects_with_429() {
    let release = Arc::new(Notify::new());
    let engine = ScriptedEngine::new(Script::Gated(release.clone()));
    let mut config = GatewayConfig::with_api_key(API_KEY);
    config.max_jobs = Some(1);
    let app = app_with(config, engine.clone());

    let first = tokio::spawn(app.clone().oneshot(tracking_post(TRACKING_BODY)));
    while engine.jobs().is_empty() {
        tokio::task::yield_now().await;
    }

    let (status, envelope) = send(app, tracking_post(TRACKING_BODY)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(envelope.meta.code, 429);

    release.notify_one();
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.jobs().len(), 1);
}

#[tokio::test]
async fn test_engine_panic_renders_internal_error() {
    let engine = ScriptedEngine::new(Script::Panic);
    let (status, envelope) = send(app(engine), tracking_post(TRACKING_BODY)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(envelope.meta.message, "Internal error");
    assert!(!serde_json::to_string(&envelope).unwrap().contains("blew up"));
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_router_from_loaded_config_and_schema_file() {
    use std::io::Write;

    let mut schema_file = tempfile::NamedTempFile::new().unwrap();
    schema_file
        .write_all(include_bytes!("../settings/schemas/request_schema.json"))
        .unwrap();

    let content = r#"
[[routes]]
path = "/v2/trackings"
"#;
    let config = GatewayConfig::resolve(Some(content), &[], |name| match name {
        "AFTERSHIP_COURIER_API_KEY" => Some(API_KEY.to_string()),
        _ => None,
    })
    .unwrap();

    let schema = Arc::new(SchemaValidator::load(schema_file.path()).unwrap());
    let engine = ScriptedEngine::new(Script::Items);
    let app = gateway_router(&config, schema, CrawlDispatcher::new(engine.clone())).unwrap();

    let request = post(
        "/v2/trackings",
        Some(API_KEY),
        Some("application/json"),
        r#"{"slug":"aftership"}"#,
    );
    let (status, envelope) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope.meta.code, 4001);

    let (status, _) = send(app, post("/trackings", Some(API_KEY), None, "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
