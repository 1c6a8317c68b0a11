//! Courier Gateway - HTTP front door for courier tracking crawls
//!
//! Accepts JSON crawl requests, validates them, hands a job to the crawl
//! engine and renders the outcome as a `{meta, data}` envelope.
//!
//! # Architecture
//!
//! ```text
//! HTTP request
//!      │
//!      ▼
//! ┌──────────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │ RequestParser│──▶│ AuthGate │──▶│ Content-Type │──▶│SchemaValidator│
//! └──────────────┘   └──────────┘   └──────────────┘   └──────┬───────┘
//!                                                             │
//!                                                             ▼
//!                    ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!    HTTP response ◀─│ResponseRender│◀──│CrawlDispatch │◀──│JobSpecBuilder│
//!                    └──────────────┘   └──────┬───────┘   └──────────────┘
//!                                              │
//!                                              ▼
//!                                       CrawlEngine (child process)
//! ```
//!
//! Any stage can fail with an [`ApiError`]; the renderer is the single exit
//! point and every body it writes is an envelope:
//!
//! ```json
//! {"meta": {"message": "Invalid payload", "code": 4001}, "data": {...}}
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_gateway::{
//!     config::GatewayConfig, dispatch::CrawlDispatcher, engine::CommandEngine,
//!     handlers::gateway_router, schema::SchemaValidator, shutdown::shutdown_signal,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load(None, &[])?;
//!     let schema = Arc::new(SchemaValidator::load(&config.schema_path)?);
//!     let engine = Arc::new(CommandEngine::new("spider-runner", Vec::new()));
//!     let app = gateway_router(&config, schema, CrawlDispatcher::new(engine))?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9080").await?;
//!     axum::serve(listener, app)
//!         .with_graceful_shutdown(shutdown_signal())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Outcome-error modes
//!
//! A finished job can still carry spider errors. `strict` routes turn them
//! into a 500; `permissive` routes return them next to the items:
//!
//! ```rust
//! use courier_gateway::engine::JobOutcome;
//! use courier_gateway::render::{OutcomeErrorMode, ResponseRenderer, CRAWL_RESOURCE_METHODS};
//! use serde_json::json;
//!
//! let outcome = JobOutcome { items: vec![json!({"n": 1})], errors: vec!["boom".into()] };
//! let renderer = ResponseRenderer::new(CRAWL_RESOURCE_METHODS, OutcomeErrorMode::Permissive);
//! let (status, envelope) = renderer.render(Ok(outcome), &json!({}));
//!
//! assert_eq!(status.as_u16(), 200);
//! assert_eq!(envelope.data["errors"], json!(["boom"]));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gates;
pub mod handlers;
pub mod job;
pub mod render;
pub mod request;
pub mod schema;
pub mod shutdown;
pub mod tracing_middleware;

pub use config::{ConfigError, GatewayConfig, ResourceProfile, RouteConfig};
pub use dispatch::CrawlDispatcher;
pub use engine::{CommandEngine, CrawlEngine, EngineError, JobOutcome};
pub use error::{ApiError, ApiResult, ErrorKind};
pub use handlers::gateway_router;
pub use job::{BuildMode, JobSpec, JobSpecBuilder, UnknownArgPolicy};
pub use render::{Envelope, OutcomeErrorMode, ResponseRenderer};
pub use schema::SchemaValidator;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
