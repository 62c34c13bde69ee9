//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::format::FormatError;
use crate::core::task::TaskError;

/// Errors that can occur when loading or building a workflow file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// An output path template could not be resolved.
    #[error("task '{task}': {source}")]
    PathTemplate {
        task: String,
        #[source]
        source: FormatError,
    },

    /// A task could not be built from its configuration.
    #[error("task '{task}': {source}")]
    Task {
        task: String,
        #[source]
        source: TaskError,
    },
}
