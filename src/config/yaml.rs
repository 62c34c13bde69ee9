//! YAML workflow files.
//!
//! A workflow file lists tasks with their command templates, ports and
//! parameters, plus engine defaults:
//!
//! ```yaml
//! defaults:
//!   mode: local
//! tasks:
//!   - name: sort
//!     command: "sort {i:in} > {o:sorted}"
//!     inputs:
//!       in: data/names.txt
//!     outputs:
//!       sorted: "{i:in}.sorted"
//! ```
//!
//! Tasks are not ordered explicitly. An input whose path equals another task's
//! output path reads from that task.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use super::error::ConfigError;
use crate::core::format::{format_path, placeholders, PlaceholderKind, Ports};
use crate::core::packet::InformationPacket;
use crate::core::types::ExecMode;
use crate::execution::ClusterConfig;

/// Engine settings shared by every task in a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution mode for tasks that do not set one.
    pub mode: ExecMode,
    /// Cluster settings, required when any task runs in cluster mode.
    pub cluster: Option<ClusterConfig>,
    /// Shell for local commands. Defaults to `bash`.
    pub shell: Option<String>,
}

/// A workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub defaults: EngineConfig,
    pub tasks: Vec<TaskConfig>,
}

/// One task in a workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name, unique within the file.
    pub name: String,
    /// Command template.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, PortConfig>,
    /// Output path templates. May reference `{i:...}` and `{p:...}`.
    #[serde(default)]
    pub outputs: BTreeMap<String, PortConfig>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub prepend: String,
    /// Overrides `defaults.mode`.
    pub mode: Option<ExecMode>,
}

/// A port: either a bare path or a path with options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Simple(String),
    Detailed {
        path: String,
        #[serde(default)]
        stream: bool,
    },
}

impl PortConfig {
    pub fn path(&self) -> &str {
        match self {
            PortConfig::Simple(path) => path,
            PortConfig::Detailed { path, .. } => path,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            PortConfig::Simple(_) => false,
            PortConfig::Detailed { stream, .. } => *stream,
        }
    }
}

impl TaskConfig {
    /// Execution mode after applying engine defaults.
    pub fn effective_mode(&self, defaults: &EngineConfig) -> ExecMode {
        self.mode.unwrap_or(defaults.mode)
    }

    /// Resolve output path templates against the declared input paths.
    pub fn output_paths(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let inputs: Ports = self
            .inputs
            .iter()
            .map(|(port, cfg)| (port.clone(), Arc::new(InformationPacket::new(cfg.path()))))
            .collect();

        self.outputs
            .iter()
            .map(|(port, cfg)| {
                format_path(cfg.path(), &inputs, &self.params)
                    .map(|path| (port.clone(), path))
                    .map_err(|source| ConfigError::PathTemplate {
                        task: self.name.clone(),
                        source,
                    })
            })
            .collect()
    }
}

/// Where a task input is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A file that no task in the workflow produces.
    File,
    /// An output of another task, by index into `tasks`.
    Task { task: usize, port: String },
}

/// Resolved wiring of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    /// Task indices, producers before consumers.
    pub order: Vec<usize>,
    /// Resolved output paths per task.
    pub output_paths: Vec<BTreeMap<String, String>>,
    /// Input sources per task.
    pub sources: Vec<BTreeMap<String, InputSource>>,
}

impl WorkflowConfig {
    /// Resolve output paths, bind inputs to producers and order the tasks.
    pub fn plan(&self) -> Result<WorkflowPlan, ConfigError> {
        let output_paths = self
            .tasks
            .iter()
            .map(TaskConfig::output_paths)
            .collect::<Result<Vec<_>, _>>()?;

        let mut producers: HashMap<&str, (usize, &str)> = HashMap::new();
        for (idx, paths) in output_paths.iter().enumerate() {
            for (port, path) in paths {
                if let Some((other, _)) = producers.insert(path.as_str(), (idx, port.as_str())) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "output path '{}' is produced by both '{}' and '{}'",
                        path, self.tasks[other].name, self.tasks[idx].name
                    )));
                }
            }
        }

        let mut sources = Vec::with_capacity(self.tasks.len());
        for (idx, task) in self.tasks.iter().enumerate() {
            let mut task_sources = BTreeMap::new();
            for (port, cfg) in &task.inputs {
                let source = match producers.get(cfg.path()) {
                    Some(&(producer, _)) if producer == idx => {
                        return Err(ConfigError::InvalidConfig(format!(
                            "task '{}' reads its own output '{}'",
                            task.name,
                            cfg.path()
                        )));
                    }
                    Some(&(producer, out_port)) => {
                        let out_stream = self.tasks[producer].outputs[out_port].is_streaming();
                        if out_stream != cfg.is_streaming() {
                            return Err(ConfigError::InvalidConfig(format!(
                                "input '{}' of task '{}' and output '{}' of task '{}' disagree on streaming",
                                port, task.name, out_port, self.tasks[producer].name
                            )));
                        }
                        InputSource::Task {
                            task: producer,
                            port: out_port.to_string(),
                        }
                    }
                    None if cfg.is_streaming() => {
                        return Err(ConfigError::InvalidConfig(format!(
                            "streaming input '{}' of task '{}' is not produced by any task",
                            port, task.name
                        )));
                    }
                    None => InputSource::File,
                };
                task_sources.insert(port.clone(), source);
            }
            sources.push(task_sources);
        }

        let order = self.execution_order(&sources)?;
        Ok(WorkflowPlan {
            order,
            output_paths,
            sources,
        })
    }

    /// Order tasks so producers come before consumers (Kahn's algorithm).
    fn execution_order(
        &self,
        sources: &[BTreeMap<String, InputSource>],
    ) -> Result<Vec<usize>, ConfigError> {
        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, task_sources) in sources.iter().enumerate() {
            let producers: HashSet<usize> = task_sources
                .values()
                .filter_map(|s| match s {
                    InputSource::Task { task, .. } => Some(*task),
                    InputSource::File => None,
                })
                .collect();
            in_degree[idx] = producers.len();
            for producer in producers {
                consumers[producer].push(idx);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &consumers[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            let cycle: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.tasks[i].name.as_str())
                .collect();
            return Err(ConfigError::InvalidConfig(format!(
                "dependency cycle detected involving tasks: {}",
                cycle.join(", ")
            )));
        }
        Ok(order)
    }
}

/// YAML workflow loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate a workflow file.
    pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config: WorkflowConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_workflow(&config)?;
        Ok(config)
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_workflow(yaml: &str) -> Result<WorkflowConfig, ConfigError> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        Self::validate_workflow(&config)?;
        Ok(config)
    }

    /// Validate a workflow configuration.
    pub fn validate_workflow(config: &WorkflowConfig) -> Result<(), ConfigError> {
        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "workflow must have at least one task".into(),
            ));
        }

        let mut names = HashSet::new();
        for task in &config.tasks {
            if task.name.is_empty() {
                return Err(ConfigError::MissingField("name".into()));
            }
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
            Self::validate_task(task)?;

            if task.effective_mode(&config.defaults) == ExecMode::Cluster
                && config.defaults.cluster.is_none()
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}' runs in cluster mode but defaults.cluster is not set",
                    task.name
                )));
            }
        }

        config.plan().map(|_| ())
    }

    /// Check that every command placeholder refers to a declared port or param.
    fn validate_task(task: &TaskConfig) -> Result<(), ConfigError> {
        for (port, cfg) in task.inputs.iter().chain(&task.outputs) {
            if cfg.path().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}': port '{}' has an empty path",
                    task.name, port
                )));
            }
        }

        for ph in placeholders(&task.command) {
            let declared = match ph.kind {
                PlaceholderKind::In => task.inputs.contains_key(&ph.name),
                PlaceholderKind::Out => task
                    .outputs
                    .get(&ph.name)
                    .is_some_and(|o| !o.is_streaming()),
                PlaceholderKind::OutStream => task
                    .outputs
                    .get(&ph.name)
                    .is_some_and(PortConfig::is_streaming),
                PlaceholderKind::Param => task.params.contains_key(&ph.name),
            };
            if !declared {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}': placeholder '{}' does not match a declared {}",
                    task.name,
                    ph,
                    match ph.kind {
                        PlaceholderKind::In => "input",
                        PlaceholderKind::Out => "file output",
                        PlaceholderKind::OutStream => "streaming output",
                        PlaceholderKind::Param => "param",
                    }
                )));
            }
        }
        Ok(())
    }
}
