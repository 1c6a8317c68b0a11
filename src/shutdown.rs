//! Graceful shutdown
//!
//! ```text
//! SIGTERM / SIGINT / Ctrl+C
//!         │
//!         ▼
//! ┌───────────────────┐
//! │ Stop accepting    │  axum::serve(..).with_graceful_shutdown
//! └───────────────────┘
//!         │
//!         ▼
//! ┌───────────────────┐
//! │ Drain crawl jobs  │◀──── timeout: 30s default
//! └───────────────────┘
//!         │
//!         ▼
//!     Clean exit
//! ```

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::dispatch::CrawlDispatcher;

/// Default bound on waiting for in-flight jobs
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// How often the drain loop checks the in-flight count
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves when the process is asked to stop
///
/// A signal handler that cannot be installed is logged and never fires;
/// the others keep working.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {}
    }
}

/// Wait until the dispatcher has no running jobs or `timeout` elapses
///
/// Returns `true` when everything finished in time.
pub async fn drain_jobs(dispatcher: &CrawlDispatcher, timeout: Duration) -> bool {
    let start = Instant::now();
    info!(
        in_flight = dispatcher.in_flight(),
        timeout = ?timeout,
        "Waiting for crawl jobs to drain"
    );

    loop {
        let in_flight = dispatcher.in_flight();
        if in_flight == 0 {
            info!("All crawl jobs drained");
            return true;
        }
        if start.elapsed() >= timeout {
            warn!(in_flight, "Drain timeout reached, abandoning running jobs");
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CrawlEngine, EngineError, JobOutcome};
    use crate::job::JobSpec;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Arc;

    struct SlowEngine(Duration);

    #[async_trait]
    impl CrawlEngine for SlowEngine {
        async fn crawl(&self, _job: JobSpec) -> Result<JobOutcome, EngineError> {
            tokio::time::sleep(self.0).await;
            Ok(JobOutcome::default())
        }
    }

    fn job() -> JobSpec {
        JobSpec {
            target_id: "aftershipspider".to_string(),
            fetch_params: Map::new(),
            start_without_fetch: true,
            max_requests: None,
            correlation_meta: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_drain_idle_dispatcher() {
        let dispatcher = CrawlDispatcher::new(Arc::new(SlowEngine(Duration::ZERO)));
        assert!(drain_jobs(&dispatcher, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_running_job() {
        let dispatcher = CrawlDispatcher::new(Arc::new(SlowEngine(Duration::from_secs(2))));
        let running = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(job()).await })
        };
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(drain_jobs(&dispatcher, Duration::from_secs(5)).await);
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let dispatcher = CrawlDispatcher::new(Arc::new(SlowEngine(Duration::from_secs(60))));
        let _running = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(job()).await })
        };
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!drain_jobs(&dispatcher, Duration::from_secs(1)).await);
    }
}
