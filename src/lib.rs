//! sciexec - task execution for file-based scientific workflows.
//!
//! A [`Task`] turns a command template with `{i:..}`, `{o:..}`, `{os:..}` and
//! `{p:..}` placeholders into a concrete command, runs it on a backend, and
//! commits its outputs atomically together with a provenance record.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod testing;

pub use config::{load_workflow, ConfigError, WorkflowBuilder, WorkflowConfig, YamlLoader};
pub use core::audit::{AuditError, AuditInfo};
pub use core::format::{
    format_command, format_path, placeholders, FormatError, Placeholder, PlaceholderKind, Ports,
};
pub use core::packet::InformationPacket;
pub use core::task::{
    Completion, CompletionError, CustomExecute, OutPathFn, PathContext, Task, TaskBuilder,
    TaskError, TaskOutcome, FATAL_EXIT_CODE,
};
pub use core::types::{ExecMode, TaskId};
pub use events::{Event, EventBus, EventHandler, TracingHandler};
pub use execution::{
    Backend, BatchQueueBackend, ClusterBackend, ClusterConfig, ExecutionBackend, ExecutionError,
    LocalBackend, Workflow, WorkflowError, WorkflowReport,
};
