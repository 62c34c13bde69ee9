//! Configuration loading and parsing.
//!
//! This module provides YAML workflow files and the builder that turns them
//! into runnable tasks.

mod builder;
mod error;
mod yaml;

pub use builder::{load_workflow, WorkflowBuilder};
pub use error::ConfigError;
pub use yaml::{
    EngineConfig, InputSource, PortConfig, TaskConfig, WorkflowConfig, WorkflowPlan, YamlLoader,
};
