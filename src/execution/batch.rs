//! Batch-queue backend.

use async_trait::async_trait;

use super::{ExecutionBackend, ExecutionError};
use crate::core::types::{ExecMode, TaskId};
use crate::events::EventBus;

/// Placeholder for a batch-queue scheduler backend.
///
/// There is no scheduler client yet, so every run fails with
/// [`ExecutionError::Unsupported`] instead of silently doing nothing.
// TODO: submit through the scheduler's REST API and poll the job until it
// reaches a terminal state, mirroring ClusterBackend.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchQueueBackend;

#[async_trait]
impl ExecutionBackend for BatchQueueBackend {
    fn mode(&self) -> ExecMode {
        ExecMode::BatchQueue
    }

    async fn run(
        &self,
        task_id: &TaskId,
        _command: &str,
        _events: &EventBus,
    ) -> Result<(), ExecutionError> {
        tracing::error!(task_id = %task_id, "Batch-queue execution mode not implemented");
        Err(ExecutionError::Unsupported(ExecMode::BatchQueue))
    }
}
