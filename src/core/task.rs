//! Tasks: one unit of work with file-addressed inputs and outputs.
//!
//! A [`Task`] is built with [`TaskBuilder`]: inputs are bound, output paths are
//! computed, and the command template is resolved before the task exists, so a
//! bad template never reaches execution. [`Task::execute`] then runs the state
//! machine:
//!
//! 1. **Skip check** - if any file output, or its `.tmp`, already exists the
//!    task is skipped and its provenance reloaded from the sidecars.
//! 2. **FIFOs** - a named pipe is created for each streaming output.
//! 3. **Run** - the custom execute function if one is set, otherwise the
//!    backend for the task's [`ExecMode`].
//! 4. **Commit** - a provenance record is attached to every output, written
//!    next to each file output, and each `.tmp` is renamed to its final path.
//!    With [`Task::execute_streaming`] the task first waits for the producers
//!    of its streaming inputs to commit, so their records are in place.
//! 5. **Completion** - the [`Completion`] signal fires.
//!
//! Between steps 2 and 3 the completion handle reports the task as started,
//! so streaming consumers know the pipe exists.
//!
//! Failures stop the task before commit and leave temp files and FIFOs in
//! place. [`Task::execute_or_exit`] turns any failure into process exit status
//! [`FATAL_EXIT_CODE`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use super::audit::{AuditError, AuditInfo};
use super::format::{format_command, FormatError, Ports};
use super::packet::InformationPacket;
use super::types::{ExecMode, TaskId};
use crate::events::{Event, EventBus};
use crate::execution::{Backend, ClusterConfig, ExecutionBackend, ExecutionError};

/// Exit status of the process when a task fails.
pub const FATAL_EXIT_CODE: i32 = 126;

/// Errors that stop a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The command template could not be resolved.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The backend failed to run the command.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Filesystem operation on a task path failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The command finished without writing an expected output.
    #[error("output '{path}' was not produced: '{temp}' is missing")]
    MissingOutput { path: String, temp: String },

    /// Provenance sidecar could not be written.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A custom execute function failed.
    #[error("custom execution failed: {0}")]
    Custom(String),

    /// `execute` was called a second time.
    #[error("task '{0}' was already executed")]
    AlreadyExecuted(TaskId),

    /// A streaming input's producer failed before committing.
    #[error("streaming input not committed: {0}")]
    Upstream(#[from] CompletionError),
}

impl TaskError {
    /// Captured command output, when there is any.
    pub fn output(&self) -> Option<&str> {
        match self {
            TaskError::Execution(e) => e.output(),
            _ => None,
        }
    }
}

/// How a task reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The command (or custom function) ran and outputs were committed.
    Executed,
    /// Outputs already existed; nothing ran.
    Skipped,
}

/// Why a [`Completion`] will never report an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("task '{0}' failed")]
    Failed(TaskId),

    #[error("task '{0}' was dropped before completing")]
    Abandoned(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Pending,
    Running,
    Done(TaskOutcome),
    Failed,
}

/// One-shot completion signal of a task.
///
/// Fires once, after outputs are committed; it can be cloned and awaited any
/// number of times. Consumers must wait on it before reading a non-streaming
/// output. Consumers of a streaming output wait on [`started`](Self::started)
/// instead, which fires once the producer's FIFOs exist.
#[derive(Debug, Clone)]
pub struct Completion {
    task_id: TaskId,
    rx: watch::Receiver<CompletionState>,
}

impl Completion {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait until the task completes.
    pub async fn wait(&self) -> Result<TaskOutcome, CompletionError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|s| matches!(s, CompletionState::Done(_) | CompletionState::Failed))
            .await
            .map(|s| *s)
            .map_err(|_| CompletionError::Abandoned(self.task_id.clone()))?;
        match state {
            CompletionState::Done(outcome) => Ok(outcome),
            _ => Err(CompletionError::Failed(self.task_id.clone())),
        }
    }

    /// Wait until the task has passed its skip check and created its FIFOs.
    pub async fn started(&self) -> Result<(), CompletionError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|s| *s != CompletionState::Pending)
            .await
            .map(|s| *s)
            .map_err(|_| CompletionError::Abandoned(self.task_id.clone()))?;
        match state {
            CompletionState::Failed => Err(CompletionError::Failed(self.task_id.clone())),
            _ => Ok(()),
        }
    }

    /// Outcome if the task has already completed.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match *self.rx.borrow() {
            CompletionState::Done(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Replaces backend dispatch with caller-supplied logic.
///
/// The task still records provenance and commits outputs afterwards, so the
/// function must write each file output to its temp path.
#[async_trait]
pub trait CustomExecute: Send + Sync {
    /// Recorded as the provenance `command` in place of a shell command.
    fn description(&self) -> String;

    async fn execute(&self, task: &Task) -> Result<(), TaskError>;
}

/// View of a task under construction, passed to output path functions.
pub struct PathContext<'a> {
    name: &'a TaskId,
    inputs: &'a Ports,
    params: &'a BTreeMap<String, String>,
}

impl<'a> PathContext<'a> {
    pub fn name(&self) -> &TaskId {
        self.name
    }

    /// Final path of an input, or `""` if the port is unknown.
    pub fn in_path(&self, port: &str) -> &str {
        self.inputs.get(port).map(|ip| ip.path()).unwrap_or("")
    }

    /// Parameter value, or `""` if unset.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Computes an output's final path from the task's inputs and parameters.
pub type OutPathFn = Arc<dyn Fn(&PathContext<'_>) -> String + Send + Sync>;

struct OutputSpec {
    port: String,
    path_fn: OutPathFn,
    stream: bool,
}

/// Builder for [`Task`].
///
/// ```
/// use sciexec::{InformationPacket, TaskBuilder};
/// use std::sync::Arc;
///
/// let task = TaskBuilder::new("sort", "sort {i:in} > {o:sorted}")
///     .input("in", Arc::new(InformationPacket::new("/data/names.txt")))
///     .output("sorted", |t| format!("{}.sorted", t.in_path("in")))
///     .build()
///     .unwrap();
///
/// assert_eq!(task.command(), "sort /data/names.txt > /data/names.txt.sorted.tmp");
/// ```
pub struct TaskBuilder {
    name: TaskId,
    template: String,
    inputs: Ports,
    outputs: Vec<OutputSpec>,
    params: BTreeMap<String, String>,
    prepend: String,
    mode: ExecMode,
    cluster: Option<ClusterConfig>,
    backend: Option<Backend>,
    custom: Option<Arc<dyn CustomExecute>>,
    events: Option<Arc<EventBus>>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<TaskId>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            inputs: Ports::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            prepend: String::new(),
            mode: ExecMode::Local,
            cluster: None,
            backend: None,
            custom: None,
            events: None,
        }
    }

    /// Bind an input port to a (possibly shared) packet.
    pub fn input(mut self, port: impl Into<String>, packet: Arc<InformationPacket>) -> Self {
        self.inputs.insert(port.into(), packet);
        self
    }

    /// Bind several input ports.
    pub fn inputs(mut self, inputs: Ports) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Declare a file output whose path is computed from the task.
    pub fn output<F>(mut self, port: impl Into<String>, path_fn: F) -> Self
    where
        F: Fn(&PathContext<'_>) -> String + Send + Sync + 'static,
    {
        self.outputs.push(OutputSpec {
            port: port.into(),
            path_fn: Arc::new(path_fn),
            stream: false,
        });
        self
    }

    /// Declare a file output at a fixed path.
    pub fn output_path(self, port: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        self.output(port, move |_| path.clone())
    }

    /// Declare an output transferred through a named pipe.
    pub fn streaming_output<F>(mut self, port: impl Into<String>, path_fn: F) -> Self
    where
        F: Fn(&PathContext<'_>) -> String + Send + Sync + 'static,
    {
        self.outputs.push(OutputSpec {
            port: port.into(),
            path_fn: Arc::new(path_fn),
            stream: true,
        });
        self
    }

    /// Declare an output with an already boxed path function.
    pub fn output_fn(mut self, port: impl Into<String>, path_fn: OutPathFn, stream: bool) -> Self {
        self.outputs.push(OutputSpec {
            port: port.into(),
            path_fn,
            stream,
        });
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    /// Text prepended to the resolved command, e.g. a container runner.
    pub fn prepend(mut self, prepend: impl Into<String>) -> Self {
        self.prepend = prepend.into();
        self
    }

    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Cluster settings, required for [`ExecMode::Cluster`].
    pub fn cluster(mut self, config: ClusterConfig) -> Self {
        self.cluster = Some(config);
        self
    }

    /// Use a specific backend instead of deriving one from the mode.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn custom_execute(mut self, custom: Arc<dyn CustomExecute>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Event bus diagnostics are reported to. Defaults to [`EventBus::logging`].
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Compute output paths and resolve the command.
    pub fn build(self) -> Result<Task, TaskError> {
        let ctx = PathContext {
            name: &self.name,
            inputs: &self.inputs,
            params: &self.params,
        };
        let mut outputs = Ports::new();
        for spec in &self.outputs {
            let path = (spec.path_fn)(&ctx);
            if path.is_empty() {
                return Err(FormatError::MissingOutPath {
                    port: spec.port.clone(),
                    command: self.template.clone(),
                }
                .into());
            }
            tracing::debug!(task_id = %self.name, port = %spec.port, "Creating output with path {}", path);
            let packet = if spec.stream {
                InformationPacket::streaming(path)
            } else {
                InformationPacket::new(path)
            };
            outputs.insert(spec.port.clone(), Arc::new(packet));
        }

        let command = format_command(
            &self.template,
            &self.inputs,
            &outputs,
            &self.params,
            &self.prepend,
        )?;
        tracing::debug!(task_id = %self.name, template = %self.template, "Formatted command: {}", command);

        let backend = match self.backend {
            Some(backend) => backend,
            None => Backend::for_mode(self.mode, self.cluster)?,
        };
        let (done, _) = watch::channel(CompletionState::Pending);

        Ok(Task {
            name: self.name,
            command,
            backend,
            custom: self.custom,
            inputs: self.inputs,
            outputs,
            params: self.params,
            events: self.events.unwrap_or_else(|| Arc::new(EventBus::logging())),
            done,
            started: AtomicBool::new(false),
        })
    }
}

/// A unit of work: resolved command, ports, and the backend to run it on.
pub struct Task {
    name: TaskId,
    command: String,
    backend: Backend,
    custom: Option<Arc<dyn CustomExecute>>,
    inputs: Ports,
    outputs: Ports,
    params: BTreeMap<String, String>,
    events: Arc<EventBus>,
    done: watch::Sender<CompletionState>,
    started: AtomicBool,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("mode", &self.exec_mode())
            .field("custom", &self.custom.as_ref().map(|c| c.description()))
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Task {
    pub fn builder(name: impl Into<TaskId>, template: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name, template)
    }

    pub fn name(&self) -> &TaskId {
        &self.name
    }

    /// The resolved command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.backend.mode()
    }

    pub fn inputs(&self) -> &Ports {
        &self.inputs
    }

    pub fn outputs(&self) -> &Ports {
        &self.outputs
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn input(&self, port: &str) -> Option<&Arc<InformationPacket>> {
        self.inputs.get(port)
    }

    pub fn output(&self, port: &str) -> Option<&Arc<InformationPacket>> {
        self.outputs.get(port)
    }

    /// Final path of an input port.
    pub fn in_path(&self, port: &str) -> Option<&str> {
        self.inputs.get(port).map(|ip| ip.path())
    }

    /// Handle for awaiting this task's completion.
    pub fn completion(&self) -> Completion {
        Completion {
            task_id: self.name.clone(),
            rx: self.done.subscribe(),
        }
    }

    /// Run the task. May be called once.
    pub async fn execute(&self) -> Result<TaskOutcome, TaskError> {
        self.execute_streaming(&[]).await
    }

    /// Run the task, waiting for `producers` (the tasks writing its streaming
    /// inputs) to complete before the provenance record is built.
    ///
    /// The wait happens after the command returns, so both ends of each pipe
    /// still run at the same time.
    pub async fn execute_streaming(
        &self,
        producers: &[Completion],
    ) -> Result<TaskOutcome, TaskError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyExecuted(self.name.clone()));
        }

        match self.run(producers).await {
            Ok(outcome) => {
                self.done.send_replace(CompletionState::Done(outcome));
                Ok(outcome)
            }
            Err(err) => {
                self.events
                    .emit(Event::task_failed(
                        self.name.clone(),
                        &self.command,
                        err.to_string(),
                        err.output().map(str::to_string),
                    ))
                    .await;
                self.done.send_replace(CompletionState::Failed);
                Err(err)
            }
        }
    }

    /// Run the task, terminating the process with [`FATAL_EXIT_CODE`] on failure.
    pub async fn execute_or_exit(&self) -> TaskOutcome {
        match self.execute().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(task_id = %self.name, command = %self.command, error = %err, "Fatal task failure, terminating run");
                std::process::exit(FATAL_EXIT_CODE);
            }
        }
    }

    /// Mark the task skipped without running it. Used for a producer whose
    /// streaming outputs nobody will read.
    pub async fn skip_unread(&self) -> Result<TaskOutcome, TaskError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyExecuted(self.name.clone()));
        }
        self.reload_provenance();
        self.events.emit(Event::task_skipped(self.name.clone())).await;
        self.done.send_replace(CompletionState::Done(TaskOutcome::Skipped));
        Ok(TaskOutcome::Skipped)
    }

    /// Whether any file output, or its temp file, is already on disk.
    pub fn outputs_present(&self) -> bool {
        self.file_outputs().any(|op| op.exists() || op.temp_exists())
    }

    /// Whether every output is a streaming output.
    pub fn streams_only(&self) -> bool {
        !self.outputs.is_empty() && self.file_outputs().next().is_none()
    }

    async fn run(&self, producers: &[Completion]) -> Result<TaskOutcome, TaskError> {
        if self.any_output_exists().await {
            self.reload_provenance();
            self.events.emit(Event::task_skipped(self.name.clone())).await;
            return Ok(TaskOutcome::Skipped);
        }

        self.prepare_fifos().await?;
        self.done.send_replace(CompletionState::Running);
        self.events
            .emit(Event::task_started(self.name.clone(), &self.command))
            .await;

        let started_at = Utc::now();
        let start = Instant::now();
        match &self.custom {
            Some(custom) => {
                self.events
                    .emit(Event::custom_executing(self.name.clone(), custom.description()))
                    .await;
                custom.execute(self).await?;
            }
            None => {
                self.events
                    .emit(Event::command_executing(
                        self.name.clone(),
                        self.exec_mode(),
                        &self.command,
                    ))
                    .await;
                self.backend
                    .run(&self.name, &self.command, &self.events)
                    .await?;
            }
        }
        let elapsed = start.elapsed();

        for producer in producers {
            producer.wait().await?;
        }
        let audit = self.audit_info(elapsed, started_at);
        self.commit(audit).await?;
        self.events
            .emit(Event::task_completed(self.name.clone(), elapsed))
            .await;
        Ok(TaskOutcome::Executed)
    }

    /// Check file outputs and their temp files. Streaming outputs never count.
    async fn any_output_exists(&self) -> bool {
        let mut any = false;
        for op in self.file_outputs() {
            if op.exists() {
                self.events
                    .emit(Event::output_exists(self.name.clone(), op.path()))
                    .await;
                any = true;
            }
            if op.temp_exists() {
                self.events
                    .emit(Event::temp_exists(self.name.clone(), op.temp_path()))
                    .await;
                any = true;
            }
        }
        any
    }

    /// Load sidecars of a skipped task's outputs so consumers see their lineage.
    fn reload_provenance(&self) {
        for op in self.file_outputs() {
            if let Err(e) = op.load_audit_log() {
                tracing::warn!(task_id = %self.name, path = %op.path(), error = %e, "Could not load provenance of existing output");
            }
        }
    }

    async fn prepare_fifos(&self) -> Result<(), TaskError> {
        for op in self.outputs.values().filter(|op| op.is_streaming()) {
            let fifo = op.fifo_path();
            if op.fifo_exists() {
                self.events
                    .emit(Event::stale_fifo(self.name.clone(), &fifo))
                    .await;
                continue;
            }
            op.create_fifo().map_err(|source| TaskError::Io {
                path: fifo.clone(),
                source,
            })?;
            self.events
                .emit(Event::fifo_created(self.name.clone(), fifo))
                .await;
        }
        Ok(())
    }

    fn audit_info(&self, elapsed: Duration, started_at: DateTime<Utc>) -> AuditInfo {
        let command = match &self.custom {
            Some(custom) => custom.description(),
            None => self.command.clone(),
        };
        let mut info = AuditInfo::new(command, self.params.clone());
        info.execution_time_millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        info.task_name = Some(self.name.to_string());
        info.started_at = Some(started_at);
        info.finished_at = Some(Utc::now());
        for ip in self.inputs.values() {
            info.upstream.insert(
                ip.path().to_string(),
                ip.audit_info().cloned().unwrap_or_default(),
            );
        }
        info
    }

    async fn commit(&self, audit: AuditInfo) -> Result<(), TaskError> {
        for op in self.outputs.values() {
            if !op.set_audit_info(audit.clone()) {
                tracing::warn!(task_id = %self.name, path = %op.path(), "Output already had provenance, keeping the existing record");
            }
        }

        for op in self.file_outputs() {
            if !op.temp_exists() {
                return Err(TaskError::MissingOutput {
                    path: op.path().to_string(),
                    temp: op.temp_path(),
                });
            }
            op.write_audit_log()?;
            op.atomize().map_err(|source| TaskError::Io {
                path: op.temp_path(),
                source,
            })?;
            self.events
                .emit(Event::output_committed(self.name.clone(), op.path()))
                .await;
        }
        Ok(())
    }

    fn file_outputs(&self) -> impl Iterator<Item = &Arc<InformationPacket>> {
        self.outputs.values().filter(|op| !op.is_streaming())
    }
}
