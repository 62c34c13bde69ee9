//! Provenance records.
//!
//! An [`AuditInfo`] describes how one data handle was produced: the resolved
//! command, the parameters, how long the backend ran, and the full records of
//! every upstream input, keyed by the input's path. Records are written next to
//! committed outputs as `<path>.audit.json` and can be loaded back by later
//! runs to reconstruct lineage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading or writing a provenance sidecar.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to read or write the sidecar file.
    #[error("failed to access audit log '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sidecar content is not a valid record.
    #[error("invalid audit log '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Lineage record attached to a produced data handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    /// Resolved command, or the custom execute description.
    #[serde(default)]
    pub command: String,
    /// Parameters the command was formatted with.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Wall-clock duration of the backend invocation.
    #[serde(default)]
    pub execution_time_millis: u64,
    /// Records of each input, keyed by the input's path.
    #[serde(default)]
    pub upstream: BTreeMap<String, AuditInfo>,
    /// Name of the producing task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AuditInfo {
    /// Create a record for a command run.
    pub fn new(command: impl Into<String>, params: BTreeMap<String, String>) -> Self {
        Self {
            command: command.into(),
            params,
            ..Default::default()
        }
    }

    /// Check whether this record carries no information (e.g. a raw source file).
    pub fn is_empty(&self) -> bool {
        self == &AuditInfo::default()
    }

    /// Longest chain of upstream records below this one.
    ///
    /// A record without upstream entries has depth 0.
    pub fn lineage_depth(&self) -> usize {
        self.upstream
            .values()
            .map(|u| u.lineage_depth() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Load a record from a JSON sidecar.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| AuditError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the record as pretty JSON.
    ///
    /// The file is written to `<path>.tmp` first and renamed into place, so a
    /// reader never sees a truncated sidecar.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), AuditError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| AuditError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}
