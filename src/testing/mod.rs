//! Testing utilities for users of the sciexec library.
//!
//! - [`RecordingHandler`]: captures every lifecycle event for assertions
//! - [`WriteContent`]: custom execute function that writes fixed bytes to an output
//! - [`FailingExecute`]: custom execute function that always fails

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use crate::core::task::{CustomExecute, Task, TaskError};
use crate::core::types::TaskId;
use crate::events::{Event, EventHandler};

/// Event handler that keeps every event it sees.
///
/// # Example
///
/// ```
/// use sciexec::testing::RecordingHandler;
/// use sciexec::EventBus;
/// use std::sync::Arc;
///
/// let recorder = Arc::new(RecordingHandler::new());
/// let bus = EventBus::with_handler(recorder.clone());
/// // build tasks with `.events(Arc::new(bus))`, run them, then inspect:
/// // let events = recorder.events().await;
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in emission order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Events emitted by one task.
    pub async fn events_for(&self, task_id: &TaskId) -> Vec<Event> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.task_id() == task_id)
            .cloned()
            .collect()
    }

    /// Number of events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Writes fixed content to one output's temp path.
///
/// Counts its invocations, which makes skip behavior easy to assert.
pub struct WriteContent {
    port: String,
    content: Vec<u8>,
    calls: AtomicU32,
}

impl WriteContent {
    pub fn new(port: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            port: port.into(),
            content: content.into(),
            calls: AtomicU32::new(0),
        }
    }

    /// How many times the task invoked this function.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomExecute for WriteContent {
    fn description(&self) -> String {
        format!("write {} bytes to {}", self.content.len(), self.port)
    }

    async fn execute(&self, task: &Task) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = task.output(&self.port).ok_or_else(|| {
            TaskError::Custom(format!("task '{}' has no output '{}'", task.name(), self.port))
        })?;
        let temp = output.temp_path();
        tokio::fs::write(&temp, &self.content)
            .await
            .map_err(|source| TaskError::Io { path: temp, source })
    }
}

/// Always fails with the given message.
pub struct FailingExecute {
    message: String,
}

impl FailingExecute {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl CustomExecute for FailingExecute {
    fn description(&self) -> String {
        "intentional test failure".to_string()
    }

    async fn execute(&self, _task: &Task) -> Result<(), TaskError> {
        Err(TaskError::Custom(self.message.clone()))
    }
}
