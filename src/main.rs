//! Courier Gateway
//!
//! HTTP front door that validates crawl requests and runs them on the
//! crawl engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use courier_gateway::{
    config::GatewayConfig,
    dispatch::CrawlDispatcher,
    engine::CommandEngine,
    handlers::gateway_router,
    schema::SchemaValidator,
    shutdown::{drain_jobs, shutdown_signal, DEFAULT_DRAIN_TIMEOUT_SECS},
    tracing_middleware::{init_tracing, LogFormat},
};
use tracing::info;

/// Courier Gateway
#[derive(Parser, Debug)]
#[command(name = "courier-gateway")]
#[command(version)]
#[command(about = "HTTP gateway for courier tracking crawls")]
#[command(long_about = r#"HTTP gateway for courier tracking crawls

Accepts JSON crawl requests, checks the API key and the request schema,
runs the matching spider through the configured engine program and
answers with a {meta, data} JSON envelope.

ENVIRONMENT:
  AFTERSHIP_COURIER_API_KEY  API key callers must send (required)
  REQUEST_SCHEMA_FILE        request schema location
  GATEWAY_LOG_FORMAT         json | pretty | compact
  RUST_LOG                   log filter

EXAMPLES:
  # Start on the default port
  courier-gateway

  # Listen on all interfaces with a config file
  courier-gateway -i 0.0.0.0 -p 9080 --config gateway.toml

  # Override single settings
  courier-gateway -s max_jobs=8 -s engine.program=/opt/spider-runner
"#)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9080")]
    port: u16,

    /// IP address to bind to
    #[arg(short, long, default_value = "localhost")]
    ip: String,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override a setting, NAME=VALUE (may be repeated)
    #[arg(short, long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(LogFormat::from_env(), args.verbose);

    let config = GatewayConfig::load(args.config.as_deref(), &args.set)
        .context("failed to load configuration")?;
    config.log_summary();

    let schema = SchemaValidator::load(&config.schema_path).with_context(|| {
        format!(
            "failed to load request schema {}",
            config.schema_path.display()
        )
    })?;
    if !schema.is_enabled() {
        info!("Request schema validation is disabled");
    }

    let engine = CommandEngine::new(config.engine.program.clone(), config.engine.args.clone())
        .with_unknown_target_exit_code(config.engine.unknown_target_exit_code);
    let dispatcher = CrawlDispatcher::new(Arc::new(engine))
        .with_max_jobs(config.max_jobs)
        .with_timeout(config.dispatch_timeout());

    let app = gateway_router(&config, Arc::new(schema), dispatcher.clone())
        .context("failed to build router")?;

    let listener = tokio::net::TcpListener::bind((args.ip.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.ip, args.port))?;
    info!(
        address = %listener.local_addr()?,
        version = courier_gateway::VERSION,
        "Courier gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    drain_jobs(&dispatcher, Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS)).await;
    info!("Courier gateway stopped");
    Ok(())
}
