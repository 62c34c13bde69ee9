//! Running a set of wired tasks.
//!
//! Every task runs on its own tokio task. A task whose input is a file output
//! of another task first waits for that producer's [`Completion`]. For a
//! streaming input it only waits until the producer has started, since
//! producer and consumer must run at the same time for the pipe to be opened.
//! The consumer still waits for that producer to commit before it records its
//! own provenance.
//!
//! A producer with only streaming outputs is skipped when every task reading
//! them will skip. Otherwise it would block on a pipe nobody opens.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info_span, Instrument};

use crate::core::task::{
    Completion, CompletionError, Task, TaskError, TaskOutcome, FATAL_EXIT_CODE,
};
use crate::core::types::TaskId;

/// Errors that stop a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("task '{task}' failed: {source}")]
    Task {
        task: TaskId,
        #[source]
        source: TaskError,
    },

    #[error("task '{task}' cannot run: {source}")]
    Upstream {
        task: TaskId,
        #[source]
        source: CompletionError,
    },

    #[error("task runner panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowReport {
    pub outcomes: BTreeMap<TaskId, TaskOutcome>,
    pub duration: Duration,
}

impl WorkflowReport {
    pub fn executed_count(&self) -> usize {
        self.count(TaskOutcome::Executed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(TaskOutcome::Skipped)
    }

    pub fn outcome(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        self.outcomes.get(task_id).copied()
    }

    fn count(&self, outcome: TaskOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }
}

#[derive(Debug)]
struct Entry {
    task: Arc<Task>,
    upstream: Vec<Completion>,
    streams: Vec<Completion>,
}

/// Tasks with the completions each must wait for.
#[derive(Debug, Default)]
pub struct Workflow {
    entries: Vec<Entry>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task that starts once every `upstream` completion has fired.
    pub fn add(&mut self, task: Arc<Task>, upstream: Vec<Completion>) {
        self.add_with_streams(task, upstream, Vec::new());
    }

    /// Like [`add`](Self::add), also waiting for the producers of streaming
    /// inputs to start.
    pub fn add_with_streams(
        &mut self,
        task: Arc<Task>,
        upstream: Vec<Completion>,
        streams: Vec<Completion>,
    ) {
        self.entries.push(Entry {
            task,
            upstream,
            streams,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.entries.iter().map(|e| &e.task)
    }

    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks().find(|t| t.name().as_str() == name)
    }

    /// Run all tasks, returning on the first failure.
    ///
    /// Tasks still running when a failure is seen are aborted.
    pub async fn run(&self) -> Result<WorkflowReport, WorkflowError> {
        let start = Instant::now();
        let unread = self.unread_producers();
        let mut set = JoinSet::new();

        for entry in &self.entries {
            let task = entry.task.clone();
            let upstream = entry.upstream.clone();
            let streams = entry.streams.clone();
            let skip = unread.contains(task.name());
            let span = info_span!("task", task_id = %task.name());
            set.spawn(
                async move {
                    if skip {
                        debug!("no reader for streaming outputs, skipping");
                        let outcome = task.skip_unread().await.map_err(|source| {
                            WorkflowError::Task {
                                task: task.name().clone(),
                                source,
                            }
                        })?;
                        return Ok::<_, WorkflowError>((task.name().clone(), outcome));
                    }
                    let blocked = |source| WorkflowError::Upstream {
                        task: task.name().clone(),
                        source,
                    };
                    for completion in &streams {
                        completion.started().await.map_err(blocked)?;
                    }
                    for completion in &upstream {
                        completion.wait().await.map_err(blocked)?;
                    }
                    debug!("upstream complete, executing");
                    let outcome = task
                        .execute_streaming(&streams)
                        .await
                        .map_err(|source| WorkflowError::Task {
                            task: task.name().clone(),
                            source,
                        })?;
                    Ok::<_, WorkflowError>((task.name().clone(), outcome))
                }
                .instrument(span),
            );
        }

        let mut report = WorkflowReport::default();
        while let Some(joined) = set.join_next().await {
            let (task_id, outcome) = joined??;
            report.outcomes.insert(task_id, outcome);
        }
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Streaming-only producers whose readers all skip, directly or through a
    /// chain of such producers.
    fn unread_producers(&self) -> BTreeSet<TaskId> {
        let mut readers: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();
        for entry in &self.entries {
            for producer in &entry.streams {
                readers
                    .entry(producer.task_id())
                    .or_default()
                    .push(entry.task.name());
            }
        }

        let mut skipping: BTreeSet<TaskId> = self
            .tasks()
            .filter(|t| t.outputs_present())
            .map(|t| t.name().clone())
            .collect();
        let mut unread = BTreeSet::new();
        loop {
            let mut changed = false;
            for task in self.tasks().filter(|t| t.streams_only()) {
                if skipping.contains(task.name()) {
                    continue;
                }
                let Some(consumers) = readers.get(task.name()) else {
                    continue;
                };
                if consumers.iter().all(|c| skipping.contains(*c)) {
                    skipping.insert(task.name().clone());
                    unread.insert(task.name().clone());
                    changed = true;
                }
            }
            if !changed {
                return unread;
            }
        }
    }

    /// Run all tasks, terminating the process with [`FATAL_EXIT_CODE`] on the
    /// first failure.
    pub async fn run_or_exit(&self) -> WorkflowReport {
        match self.run().await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "Workflow failed, terminating run");
                std::process::exit(FATAL_EXIT_CODE);
            }
        }
    }
}
