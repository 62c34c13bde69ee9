//! Failure integration tests.
//!
//! Tests that a failing task stops the run: the `sx` binary exits with the
//! fatal status, nothing is committed, and diagnostics are reported.

use crate::common::{path_in, recording_bus, write_workflow};
use sciexec::testing::FailingExecute;
use sciexec::{CompletionError, Event, TaskBuilder, TaskError, TaskId, FATAL_EXIT_CODE};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;

fn sx(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sx"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .unwrap()
}

/// Test: A failing command exits 126, leaves its temp file and commits nothing.
#[test]
fn test_failing_command_exits_with_fatal_status() {
    let dir = TempDir::new().unwrap();
    let out = path_in(&dir, "broken.txt");
    let after = path_in(&dir, "after.txt");
    let yaml = format!(
        r#"
tasks:
  - name: broken
    command: "echo partial > {{o:out}}; echo 'disk on fire' >&2; exit 7"
    outputs: {{ out: "{out}" }}
  - name: after
    command: "cat {{i:in}} > {{o:out}}"
    inputs: {{ in: "{out}" }}
    outputs: {{ out: "{after}" }}
"#,
        out = out,
        after = after
    );
    let file = write_workflow(&dir, &yaml);

    let output = sx(&["run", file.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(FATAL_EXIT_CODE));
    assert!(!Path::new(&out).exists());
    assert!(Path::new(&format!("{}.tmp", out)).exists());
    assert!(!Path::new(&format!("{}.audit.json", out)).exists());
    assert!(!Path::new(&after).exists());

    let logs = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(logs.contains("disk on fire"), "missing captured output: {}", logs);
    assert!(logs.contains("exit 7"), "missing failed command: {}", logs);
}

/// Test: A template error exits 126 before anything runs.
#[test]
fn test_format_error_exits_before_running() {
    let dir = TempDir::new().unwrap();
    let marker = path_in(&dir, "ran.txt");
    let yaml = format!(
        r#"
tasks:
  - name: first
    command: "touch {marker} # {{o:out}}"
    outputs: {{ out: "{out}" }}
  - name: bad
    command: "head -n {{p:lines}} /etc/hosts"
    params: {{ lines: "" }}
"#,
        marker = marker,
        out = path_in(&dir, "first.txt")
    );
    let file = write_workflow(&dir, &yaml);

    let output = sx(&["run", file.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(FATAL_EXIT_CODE));
    assert!(!Path::new(&marker).exists());
    let stderr_and_out = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stderr_and_out.contains("Missing param for param 'lines'"));
}

/// Test: `sx validate` rejects a broken file without running it.
#[test]
fn test_validate_rejects_undeclared_port() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        r#"
tasks:
  - name: t
    command: "cat {i:missing}"
"#,
    );

    let output = sx(&["validate", file.to_str().unwrap()]);

    assert!(!output.status.success());
    assert_ne!(output.status.code(), Some(FATAL_EXIT_CODE));
}

/// Test: `sx validate` accepts a good file.
#[test]
fn test_validate_accepts_good_file() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        r#"
tasks:
  - name: t
    command: "echo hi > {o:out}"
    outputs: { out: hi.txt }
"#,
    );

    let output = sx(&["validate", file.to_str().unwrap()]);

    assert!(output.status.success());
    assert!(!dir.path().join("hi.txt").exists());
}

/// Test: A failure reports one TaskFailed event and a failed completion.
#[tokio::test]
async fn test_failure_event_and_completion() {
    let dir = TempDir::new().unwrap();
    let (recorder, bus) = recording_bus();
    let task = TaskBuilder::new("doomed", "")
        .output_path("out", path_in(&dir, "never.txt"))
        .custom_execute(Arc::new(FailingExecute::new("no luck")))
        .events(bus)
        .build()
        .unwrap();

    let err = task.execute().await.unwrap_err();

    assert!(matches!(err, TaskError::Custom(_)));
    assert_eq!(
        task.completion().wait().await,
        Err(CompletionError::Failed(TaskId::new("doomed")))
    );
    let failures: Vec<Event> = recorder
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, Event::TaskFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        Event::TaskFailed { error, output, .. } => {
            assert!(error.contains("no luck"));
            assert!(output.is_none());
        }
        other => panic!("Expected TaskFailed, got {:?}", other),
    }
}

/// Test: A task without cluster settings cannot be built in cluster mode.
#[test]
fn test_cluster_mode_requires_settings() {
    let result = TaskBuilder::new("remote", "true")
        .mode(sciexec::ExecMode::Cluster)
        .build();

    assert!(matches!(result, Err(TaskError::Execution(_))));
}
