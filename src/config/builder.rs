//! Workflow builder from YAML configuration.
//!
//! Converts a [`WorkflowConfig`] into runnable tasks. Inputs bound to another
//! task's output share that task's packet, so provenance flows downstream
//! without any extra bookkeeping.

use std::path::Path;
use std::sync::Arc;

use crate::core::packet::InformationPacket;
use crate::core::task::{PathContext, Task, TaskBuilder};
use crate::core::types::ExecMode;
use crate::events::EventBus;
use crate::execution::{Backend, LocalBackend, Workflow};

use super::error::ConfigError;
use super::yaml::{InputSource, TaskConfig, WorkflowConfig, YamlLoader};

/// Builder for creating a [`Workflow`] from configuration.
pub struct WorkflowBuilder {
    events: Arc<EventBus>,
}

impl WorkflowBuilder {
    /// Every built task reports to `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// Build tasks in producer-first order and wire them together.
    pub fn build(&self, config: &WorkflowConfig) -> Result<Workflow, ConfigError> {
        let plan = config.plan()?;
        let mut built: Vec<Option<Arc<Task>>> = vec![None; config.tasks.len()];
        let mut workflow = Workflow::new();

        for &idx in &plan.order {
            let task_config = &config.tasks[idx];
            let mut builder = self.task_builder(config, task_config);
            let mut upstream = Vec::new();
            let mut streams = Vec::new();

            for (port, port_config) in &task_config.inputs {
                let source = plan.sources[idx].get(port).unwrap_or(&InputSource::File);
                let packet = match source {
                    InputSource::File => Arc::new(
                        InformationPacket::from_existing(port_config.path()).map_err(|e| {
                            ConfigError::InvalidConfig(format!(
                                "task '{}': input '{}': {}",
                                task_config.name, port, e
                            ))
                        })?,
                    ),
                    InputSource::Task { task, port: out_port } => {
                        let producer = built[*task].as_ref().ok_or_else(|| {
                            ConfigError::InvalidConfig(format!(
                                "task '{}' was not built before its consumer '{}'",
                                config.tasks[*task].name, task_config.name
                            ))
                        })?;
                        if port_config.is_streaming() {
                            streams.push(producer.completion());
                        } else {
                            upstream.push(producer.completion());
                        }
                        producer.output(out_port).cloned().ok_or_else(|| {
                            ConfigError::InvalidConfig(format!(
                                "task '{}' has no output '{}'",
                                producer.name(),
                                out_port
                            ))
                        })?
                    }
                };
                builder = builder.input(port.clone(), packet);
            }

            for (port, port_config) in &task_config.outputs {
                let path = plan.output_paths[idx]
                    .get(port)
                    .cloned()
                    .unwrap_or_default();
                builder = builder.output_fn(
                    port.clone(),
                    Arc::new(move |_: &PathContext<'_>| path.clone()),
                    port_config.is_streaming(),
                );
            }

            let task = Arc::new(builder.build().map_err(|source| ConfigError::Task {
                task: task_config.name.clone(),
                source,
            })?);
            tracing::debug!(task_id = %task.name(), command = %task.command(), "Built task");
            built[idx] = Some(task.clone());
            workflow.add_with_streams(task, upstream, streams);
        }

        Ok(workflow)
    }

    fn task_builder(&self, config: &WorkflowConfig, task: &TaskConfig) -> TaskBuilder {
        let mode = task.effective_mode(&config.defaults);
        let mut builder = TaskBuilder::new(task.name.as_str(), task.command.as_str())
            .params(task.params.clone())
            .prepend(task.prepend.as_str())
            .mode(mode)
            .events(self.events.clone());

        if let Some(cluster) = &config.defaults.cluster {
            builder = builder.cluster(cluster.clone());
        }
        if let (ExecMode::Local, Some(shell)) = (mode, &config.defaults.shell) {
            builder = builder.backend(Backend::Local(LocalBackend::with_shell(shell)));
        }
        builder
    }
}

/// Load, validate and build a workflow file.
pub fn load_workflow(path: impl AsRef<Path>, events: Arc<EventBus>) -> Result<Workflow, ConfigError> {
    let config = YamlLoader::load_workflow(path)?;
    WorkflowBuilder::new(events).build(&config)
}
