//! Error types surfaced by the worker supervisor and its services.

use std::path::PathBuf;

use thiserror::Error;

/// Failures from [`WorkerSupervisor`](crate::daemon::WorkerSupervisor) calls.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker could not be spawned or never became ready.
    ///
    /// `diagnostics` holds the tail of the worker's captured stderr.
    #[error("worker initialization failed: {reason}")]
    Initialization { reason: String, diagnostics: String },

    /// The worker process was required but is not running.
    #[error("worker process is not running")]
    WorkerNotRunning,

    /// No response artifact appeared before the deadline while the worker
    /// stayed alive.
    #[error("no response for artifact {artifact_id} after {waited_ms}ms")]
    ResponseTimeout { artifact_id: String, waited_ms: u64 },

    /// The worker processed the request and reported a failure.
    #[error("worker reported failure: {0}")]
    Worker(String),

    /// The request payload could not be serialized.
    #[error("request payload could not be serialized: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Filesystem failure while asserting directories or publishing an
    /// artifact.
    #[error("artifact io at {path}: {source}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Stderr tail captured at initialization failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Initialization { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}
