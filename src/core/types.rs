//! Core identifier and mode types.
//!
//! [`TaskId`] names a task within a run. [`ExecMode`] selects the backend
//! a task's resolved command is dispatched to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a task within a run.
///
/// The name namespaces cluster job names, so it should be a valid
/// lowercase DNS label when the task runs in [`ExecMode::Cluster`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment a task's command runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Shell subprocess on this host.
    #[default]
    Local,
    /// Batch-queue scheduler job.
    BatchQueue,
    /// Run-to-completion job on a container-orchestration cluster.
    Cluster,
}

impl ExecMode {
    /// Stable lowercase name, as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Local => "local",
            ExecMode::BatchQueue => "batch_queue",
            ExecMode::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
