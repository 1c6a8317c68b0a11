//! Crawl job dispatch
//!
//! [`CrawlDispatcher`] hands a [`JobSpec`] to the engine and awaits its
//! outcome. It enforces an optional cap on concurrently running jobs and an
//! optional per-job timeout, and keeps an in-flight count that shutdown
//! uses to drain.
//!
//! Cancellation is by drop: when the caller disconnects, axum drops the
//! handler future, which drops the engine future, which kills the engine
//! process. The job's permit and in-flight slot are released on the same
//! drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::engine::{CrawlEngine, EngineError, JobOutcome};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::job::JobSpec;

/// Submits jobs to a [`CrawlEngine`]
///
/// Cheap to clone; clones share the engine, the job cap and the in-flight
/// count.
#[derive(Clone)]
pub struct CrawlDispatcher {
    engine: Arc<dyn CrawlEngine>,
    permits: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
}

impl CrawlDispatcher {
    /// Unbounded dispatcher without a timeout
    pub fn new(engine: Arc<dyn CrawlEngine>) -> Self {
        Self {
            engine,
            permits: None,
            timeout: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap concurrently running jobs; `None` or `0` means unbounded
    pub fn with_max_jobs(mut self, max_jobs: Option<usize>) -> Self {
        self.permits = max_jobs
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    /// Fail jobs that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Jobs currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run a job and wait for its outcome
    ///
    /// # Errors
    ///
    /// - 429 when the job cap is exhausted
    /// - 400/4002 when the engine does not know the target
    /// - 500 for engine failures and timeouts
    pub async fn submit(&self, job: JobSpec) -> ApiResult<JobOutcome> {
        let _permit = match &self.permits {
            Some(permits) => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    counter!("gateway_jobs_rejected_total").increment(1);
                    warn!(target_id = %job.target_id, "Job cap reached, rejecting job");
                    return Err(ApiError::new(ErrorKind::TooManyJobs));
                }
            },
            None => None,
        };
        let _slot = InFlightGuard::enter(&self.in_flight);

        counter!("gateway_jobs_submitted_total").increment(1);
        let target_id = job.target_id.clone();
        let started = Instant::now();
        info!(target_id = %target_id, "Dispatching crawl job");

        let run = self.engine.crawl(job);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    error!(target_id = %target_id, timeout = ?limit, "Crawl job timed out");
                    return Err(ApiError::internal());
                }
            },
            None => run.await,
        };

        let elapsed = started.elapsed();
        histogram!("gateway_job_duration_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(outcome) => {
                debug!(
                    target_id = %target_id,
                    items = outcome.items.len(),
                    errors = outcome.errors.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Crawl job finished"
                );
                Ok(outcome)
            }
            Err(e @ EngineError::UnknownTarget(_)) => {
                info!(target_id = %target_id, "Unknown crawl target");
                Err(e.into())
            }
            Err(e) => {
                error!(target_id = %target_id, error = %e, "Crawl job failed");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for CrawlDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlDispatcher")
            .field("max_jobs_available", &self.permits.as_ref().map(|p| p.available_permits()))
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Counts a job as in flight until dropped
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
