//! Local shell backend.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::{ExecutionBackend, ExecutionError};
use crate::core::types::{ExecMode, TaskId};
use crate::events::EventBus;

/// Runs commands through a shell subprocess on this host.
///
/// stdout and stderr are captured together and returned in
/// [`ExecutionError::CommandFailed`] when the command exits non-zero.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: String,
}

impl LocalBackend {
    /// Use a shell other than `bash`. It must accept `-c <command>`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Shell the command is passed to.
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::with_shell("bash")
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn mode(&self) -> ExecMode {
        ExecMode::Local
    }

    async fn run(
        &self,
        task_id: &TaskId,
        command: &str,
        _events: &EventBus,
    ) -> Result<(), ExecutionError> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ExecutionError::Spawn)?;

        if output.status.success() {
            tracing::debug!(task_id = %task_id, "Command finished");
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(ExecutionError::CommandFailed {
            code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}
