//! HTTP surface of the gateway
//!
//! - [`crawl`] - the crawl resource mounted at every configured route
//!
//! [`gateway_router`] mounts one resource per route, with and without a
//! trailing slash, and wraps them in the request-id, trace and panic layers. Paths without a resource get the 404
//! envelope; undeclared methods on a resource get the 405 envelope.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_gateway::{
//!     config::GatewayConfig, dispatch::CrawlDispatcher, engine::CommandEngine,
//!     handlers::gateway_router, schema::SchemaValidator,
//! };
//!
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load(None, &[])?;
//! let schema = Arc::new(SchemaValidator::load(&config.schema_path)?);
//! let engine = Arc::new(CommandEngine::new(config.engine.program.clone(), Vec::new()));
//! let dispatcher = CrawlDispatcher::new(engine);
//! let app = gateway_router(&config, schema, dispatcher)?;
//! # Ok(())
//! # }
//! ```

pub mod crawl;

use std::sync::Arc;

use axum::{
    extract::Request,
    response::Response,
    routing::{get, MethodRouter},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::config::{ConfigError, GatewayConfig};
use crate::dispatch::CrawlDispatcher;
use crate::render::{handle_panic, not_found};
use crate::schema::SchemaValidator;
use crate::tracing_middleware::{request_tracing_layer, RequestIdLayer};

pub use crawl::{crawl_get, crawl_method_not_allowed, crawl_post, CrawlResource};

/// Route label used for requests that match no resource
const UNROUTED: &str = "unrouted";

/// Build the complete application router
///
/// # Errors
///
/// Fails when a route's configuration cannot be turned into a resource.
pub fn gateway_router(
    config: &GatewayConfig,
    schema: Arc<SchemaValidator>,
    dispatcher: CrawlDispatcher,
) -> Result<Router, ConfigError> {
    let mut router = Router::new();

    for route in &config.routes {
        let resource = Arc::new(CrawlResource::new(
            route,
            config,
            Arc::clone(&schema),
            dispatcher.clone(),
        )?);
        let base = route.path.trim_end_matches('/');
        info!(path = %base, "Mounted crawl resource");
        router = router
            .route(base, crawl_routes(Arc::clone(&resource)))
            .route(&format!("{}/", base), crawl_routes(resource));
    }

    let max_body_bytes = config.max_body_bytes;
    Ok(router
        .fallback(move |request: Request| unrouted(request, max_body_bytes))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(request_tracing_layer())
        .layer(RequestIdLayer::new()))
}

fn crawl_routes(resource: Arc<CrawlResource>) -> MethodRouter {
    get(crawl_get)
        .post(crawl_post)
        .fallback(crawl_method_not_allowed)
        .with_state(resource)
}

async fn unrouted(request: Request, max_body_bytes: usize) -> Response {
    info!(path = %request.uri().path(), "No resource at path");
    let context = crawl::buffered_context(request.into_body(), max_body_bytes).await;
    let response = not_found(&context);
    crawl::record_request(UNROUTED, response.status());
    response
}
