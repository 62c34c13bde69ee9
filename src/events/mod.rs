//! Task lifecycle events.
//!
//! Tasks and backends report what they do through an [`EventBus`] passed in at
//! construction rather than through global loggers. [`TracingHandler`] forwards
//! events to `tracing`; tests register a recording handler to capture them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{ExecMode, TaskId};

/// Lifecycle events emitted while a task executes.
#[derive(Debug, Clone)]
pub enum Event {
    /// The task passed the resumability check and is about to run.
    TaskStarted {
        task_id: TaskId,
        command: String,
        timestamp: Instant,
    },

    /// A resolved command is being handed to a backend.
    CommandExecuting {
        task_id: TaskId,
        mode: ExecMode,
        command: String,
        timestamp: Instant,
    },

    /// A custom execute function replaces the backend dispatch.
    CustomExecuting {
        task_id: TaskId,
        description: String,
        timestamp: Instant,
    },

    /// A committed output already exists; the task will be skipped.
    OutputExists {
        task_id: TaskId,
        path: String,
        timestamp: Instant,
    },

    /// A temp file from an earlier run exists; the task will be skipped.
    ///
    /// Usually left behind by a failed run and needs cleaning up before a retry.
    TempExists {
        task_id: TaskId,
        path: String,
        timestamp: Instant,
    },

    /// The task did not run because its outputs are already present.
    TaskSkipped { task_id: TaskId, timestamp: Instant },

    /// A named pipe was created for a streaming output.
    FifoCreated {
        task_id: TaskId,
        path: String,
        timestamp: Instant,
    },

    /// A named pipe from an earlier run was found and will be reused.
    StaleFifo {
        task_id: TaskId,
        path: String,
        timestamp: Instant,
    },

    /// A cluster job was accepted by the API server.
    ClusterJobSubmitted {
        task_id: TaskId,
        job_name: String,
        timestamp: Instant,
    },

    /// An output was renamed from its temp path to its final path.
    OutputCommitted {
        task_id: TaskId,
        path: String,
        timestamp: Instant,
    },

    /// The task ran and committed its outputs.
    TaskCompleted {
        task_id: TaskId,
        duration: Duration,
        timestamp: Instant,
    },

    /// The task failed; the run is expected to stop.
    TaskFailed {
        task_id: TaskId,
        command: String,
        error: String,
        output: Option<String>,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::TaskStarted { timestamp, .. }
            | Event::CommandExecuting { timestamp, .. }
            | Event::CustomExecuting { timestamp, .. }
            | Event::OutputExists { timestamp, .. }
            | Event::TempExists { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::FifoCreated { timestamp, .. }
            | Event::StaleFifo { timestamp, .. }
            | Event::ClusterJobSubmitted { timestamp, .. }
            | Event::OutputCommitted { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. } => *timestamp,
        }
    }

    /// The task the event belongs to.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::CommandExecuting { task_id, .. }
            | Event::CustomExecuting { task_id, .. }
            | Event::OutputExists { task_id, .. }
            | Event::TempExists { task_id, .. }
            | Event::TaskSkipped { task_id, .. }
            | Event::FifoCreated { task_id, .. }
            | Event::StaleFifo { task_id, .. }
            | Event::ClusterJobSubmitted { task_id, .. }
            | Event::OutputCommitted { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. } => task_id,
        }
    }

    pub fn task_started(task_id: TaskId, command: impl Into<String>) -> Self {
        Event::TaskStarted {
            task_id,
            command: command.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn command_executing(task_id: TaskId, mode: ExecMode, command: impl Into<String>) -> Self {
        Event::CommandExecuting {
            task_id,
            mode,
            command: command.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn custom_executing(task_id: TaskId, description: impl Into<String>) -> Self {
        Event::CustomExecuting {
            task_id,
            description: description.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn output_exists(task_id: TaskId, path: impl Into<String>) -> Self {
        Event::OutputExists {
            task_id,
            path: path.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn temp_exists(task_id: TaskId, path: impl Into<String>) -> Self {
        Event::TempExists {
            task_id,
            path: path.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn task_skipped(task_id: TaskId) -> Self {
        Event::TaskSkipped {
            task_id,
            timestamp: Instant::now(),
        }
    }

    pub fn fifo_created(task_id: TaskId, path: impl Into<String>) -> Self {
        Event::FifoCreated {
            task_id,
            path: path.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn stale_fifo(task_id: TaskId, path: impl Into<String>) -> Self {
        Event::StaleFifo {
            task_id,
            path: path.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn cluster_job_submitted(task_id: TaskId, job_name: impl Into<String>) -> Self {
        Event::ClusterJobSubmitted {
            task_id,
            job_name: job_name.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn output_committed(task_id: TaskId, path: impl Into<String>) -> Self {
        Event::OutputCommitted {
            task_id,
            path: path.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn task_completed(task_id: TaskId, duration: Duration) -> Self {
        Event::TaskCompleted {
            task_id,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskFailed event, with the command's captured output if any.
    pub fn task_failed(
        task_id: TaskId,
        command: impl Into<String>,
        error: impl Into<String>,
        output: Option<String>,
    ) -> Self {
        Event::TaskFailed {
            task_id,
            command: command.into(),
            error: error.into(),
            output,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Create a bus with one handler already registered.
    pub fn with_handler(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handlers: RwLock::new(vec![handler]),
        }
    }

    /// Create a bus that forwards every event to `tracing`.
    pub fn logging() -> Self {
        Self::with_handler(Arc::new(TracingHandler))
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards events to `tracing` at a level matching their severity.
///
/// Command executions are logged under the `sciexec::audit` target so they can
/// be routed to a separate audit log with an `EnvFilter` directive.
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TaskStarted { task_id, command, .. } => {
                tracing::debug!(task_id = %task_id, command = %command, "Executing task");
            }
            Event::CommandExecuting {
                task_id,
                mode,
                command,
                ..
            } => {
                tracing::info!(target: "sciexec::audit", task_id = %task_id, mode = %mode, "Executing command: {}", command);
            }
            Event::CustomExecuting {
                task_id,
                description,
                ..
            } => {
                tracing::info!(target: "sciexec::audit", task_id = %task_id, "Executing custom execution function: {}", description);
            }
            Event::OutputExists { task_id, path, .. } => {
                tracing::info!(task_id = %task_id, "Output file already exists, so skipping: {}", path);
            }
            Event::TempExists { task_id, path, .. } => {
                tracing::warn!(
                    task_id = %task_id,
                    "Temp file already exists, so skipping: {} (if resuming from a failed run, clean up .tmp files first)",
                    path
                );
            }
            Event::TaskSkipped { task_id, .. } => {
                tracing::info!(task_id = %task_id, "Task skipped, outputs already present");
            }
            Event::FifoCreated { task_id, path, .. } => {
                tracing::debug!(task_id = %task_id, "Created FIFO: {}", path);
            }
            Event::StaleFifo { task_id, path, .. } => {
                tracing::warn!(
                    task_id = %task_id,
                    "FIFO already exists, reusing it: {} (check the workflow for a stale pipe from an earlier run)",
                    path
                );
            }
            Event::ClusterJobSubmitted {
                task_id, job_name, ..
            } => {
                tracing::info!(task_id = %task_id, "Started cluster job '{}'", job_name);
            }
            Event::OutputCommitted { task_id, path, .. } => {
                tracing::debug!(task_id = %task_id, "Atomized output: {}", path);
            }
            Event::TaskCompleted {
                task_id, duration, ..
            } => {
                tracing::info!(task_id = %task_id, "Task completed in {:?}", duration);
            }
            Event::TaskFailed {
                task_id,
                command,
                error,
                output,
                ..
            } => {
                tracing::error!(task_id = %task_id, command = %command, "Task failed: {}", error);
                if let Some(out) = output {
                    for line in out.trim().lines() {
                        tracing::error!(task_id = %task_id, "    output: {}", line);
                    }
                }
            }
        }
    }
}
