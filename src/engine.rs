//! Crawl engine seam
//!
//! The gateway never crawls anything itself. A [`CrawlEngine`] takes a
//! [`JobSpec`] and eventually yields a [`JobOutcome`]; the dispatcher owns
//! concurrency and timeouts around it.
//!
//! [`CommandEngine`] is the production implementation: it runs an external
//! program per job, writes the job as JSON to its stdin and reads the outcome
//! as JSON from its stdout. The child is killed if the job future is dropped,
//! which is what happens when the caller disconnects or the dispatcher times
//! the job out.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ApiError, ErrorKind};
use crate::job::JobSpec;

/// Exit code the engine program uses for "no such spider"
pub const DEFAULT_UNKNOWN_TARGET_EXIT_CODE: i32 = 2;

/// Collected results of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Scraped items, in yield order
    #[serde(default)]
    pub items: Vec<Value>,
    /// Errors the spider reported while running, as the engine described them
    #[serde(default)]
    pub errors: Vec<Value>,
}

impl JobOutcome {
    /// Outcome with items only
    pub fn with_items(items: Vec<Value>) -> Self {
        Self {
            items,
            errors: Vec::new(),
        }
    }

    /// Whether the spider reported any error
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Engine failures
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine has no spider by this name
    #[error("Unknown crawl target: {0}")]
    UnknownTarget(String),

    /// The engine ran but failed
    #[error("Engine failed with exit code {code:?}: {stderr}")]
    Failed {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Trimmed stderr
        stderr: String,
    },

    /// Spawning or talking to the engine failed
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine produced output that is not a job outcome
    #[error("Malformed engine output: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownTarget(_) => ApiError::new(ErrorKind::InvalidSlug),
            _ => ApiError::internal(),
        }
    }
}

/// Something that can run a crawl job
#[async_trait]
pub trait CrawlEngine: Send + Sync {
    /// Run `job` to completion
    async fn crawl(&self, job: JobSpec) -> Result<JobOutcome, EngineError>;
}

/// Runs each job as a child process
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    unknown_target_exit_code: i32,
}

impl CommandEngine {
    /// Engine invoking `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            unknown_target_exit_code: DEFAULT_UNKNOWN_TARGET_EXIT_CODE,
        }
    }

    /// Override the exit code mapped to [`EngineError::UnknownTarget`]
    pub fn with_unknown_target_exit_code(mut self, code: i32) -> Self {
        self.unknown_target_exit_code = code;
        self
    }

    /// Program being run
    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl CrawlEngine for CommandEngine {
    async fn crawl(&self, job: JobSpec) -> Result<JobOutcome, EngineError> {
        let input = serde_json::to_vec(&job)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(
            program = %self.program,
            target_id = %job.target_id,
            pid = ?child.id(),
            "Spawned engine process"
        );

        // Feed stdin while stdout and stderr drain; the child may write
        // before it reads, or exit without reading at all.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        match fed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(target_id = %job.target_id, "Engine closed stdin before reading the job");
            }
            Err(e) => return Err(e.into()),
        }

        if output.status.success() {
            return Ok(serde_json::from_slice(&output.stdout)?);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code();
        if code == Some(self.unknown_target_exit_code) {
            debug!(target_id = %job.target_id, "Engine does not know target");
            return Err(EngineError::UnknownTarget(job.target_id));
        }

        warn!(
            program = %self.program,
            target_id = %job.target_id,
            code = ?code,
            stderr = %stderr,
            "Engine process failed"
        );
        Err(EngineError::Failed { code, stderr })
    }
}
