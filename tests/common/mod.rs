//! Common test utilities shared across integration tests.

use sciexec::testing::RecordingHandler;
use sciexec::EventBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Absolute path of `name` inside `dir`, as the string form tasks use.
pub fn path_in(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().to_string()
}

/// Event bus with a recorder attached.
pub fn recording_bus() -> (Arc<RecordingHandler>, Arc<EventBus>) {
    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::with_handler(recorder.clone()));
    (recorder, bus)
}

/// Write a workflow file into `dir`.
pub fn write_workflow(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("workflow.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

/// Files in `dir` whose name ends with `suffix`.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(suffix))
        .collect();
    names.sort();
    names
}

/// Wait for a file to appear, polling the filesystem.
///
/// # Panics
///
/// Panics if the timeout is reached before the file exists.
pub async fn wait_for_file(path: &str, timeout: Duration) {
    let start = tokio::time::Instant::now();
    while !Path::new(path).exists() {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for {} to appear", path);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
