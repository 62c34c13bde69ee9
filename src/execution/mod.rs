//! Execution backends.
//!
//! A backend runs one resolved command to completion and reports failure.
//! Backends only execute; provenance and commit are the task's job and run the
//! same way whichever backend was used.
//!
//! - [`LocalBackend`]: `bash -c` subprocess on this host
//! - [`BatchQueueBackend`]: not supported yet, always returns a typed error
//! - [`ClusterBackend`]: run-to-completion job on a Kubernetes cluster
//!
//! [`Workflow`] runs a set of tasks concurrently, each after the producers of
//! its file inputs have completed.

mod batch;
mod cluster;
mod local;
mod workflow;

pub use batch::BatchQueueBackend;
pub use cluster::{job_manifest, ClusterBackend, ClusterConfig, JobNames, JobState};
pub use local::LocalBackend;
pub use workflow::{Workflow, WorkflowError, WorkflowReport};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::{ExecMode, TaskId};
use crate::events::EventBus;

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The shell could not be started.
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    /// The command exited with a non-zero status.
    #[error("command exited with code {code}")]
    CommandFailed { code: i32, output: String },

    /// The execution mode has no implementation.
    #[error("{0} execution mode is not supported")]
    Unsupported(ExecMode),

    /// The backend could not be configured (missing settings, bad kubeconfig).
    #[error("backend configuration error: {0}")]
    Config(String),

    /// Transport error talking to the cluster API.
    #[error("cluster API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The cluster API answered with an error status.
    #[error("cluster API returned {status} for {url}: {body}")]
    ApiStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// The cluster job reached a failed terminal state.
    #[error("cluster job '{job}' failed: {reason}")]
    JobFailed { job: String, reason: String },
}

impl ExecutionError {
    /// Captured command output, when the failure came from a command run.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Runs a resolved command to completion.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Execution mode this backend implements.
    fn mode(&self) -> ExecMode;

    /// Run `command` for `task_id`, returning once it has reached a terminal
    /// state.
    async fn run(
        &self,
        task_id: &TaskId,
        command: &str,
        events: &EventBus,
    ) -> Result<(), ExecutionError>;
}

/// The closed set of backends a task can dispatch to.
#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalBackend),
    BatchQueue(BatchQueueBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    /// Build the backend for `mode`. Cluster mode requires `cluster` settings.
    pub fn for_mode(mode: ExecMode, cluster: Option<ClusterConfig>) -> Result<Self, ExecutionError> {
        match mode {
            ExecMode::Local => Ok(Backend::Local(LocalBackend::default())),
            ExecMode::BatchQueue => Ok(Backend::BatchQueue(BatchQueueBackend)),
            ExecMode::Cluster => cluster
                .map(|cfg| Backend::Cluster(ClusterBackend::new(cfg)))
                .ok_or_else(|| {
                    ExecutionError::Config(
                        "cluster execution mode requires cluster settings".to_string(),
                    )
                }),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Local(LocalBackend::default())
    }
}

#[async_trait]
impl ExecutionBackend for Backend {
    fn mode(&self) -> ExecMode {
        match self {
            Backend::Local(b) => b.mode(),
            Backend::BatchQueue(b) => b.mode(),
            Backend::Cluster(b) => b.mode(),
        }
    }

    async fn run(
        &self,
        task_id: &TaskId,
        command: &str,
        events: &EventBus,
    ) -> Result<(), ExecutionError> {
        match self {
            Backend::Local(b) => b.run(task_id, command, events).await,
            Backend::BatchQueue(b) => b.run(task_id, command, events).await,
            Backend::Cluster(b) => b.run(task_id, command, events).await,
        }
    }
}
