//! Resume scenario integration tests.
//!
//! Tests that re-running a workflow only does the work whose outputs are
//! missing, and that skipped tasks still pass their lineage downstream.

use crate::common::{path_in, recording_bus, write_workflow};
use sciexec::{load_workflow, Event, TaskOutcome};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn pipeline(dir: &TempDir) -> (std::path::PathBuf, String, String) {
    let data = path_in(dir, "in.txt");
    let log = path_in(dir, "runs.log");
    std::fs::write(&data, "c\nb\na\n").unwrap();
    let yaml = format!(
        r#"
tasks:
  - name: sort
    command: "echo sort >> {{p:log}}; sort {{i:in}} > {{o:out}}"
    params: {{ log: "{log}" }}
    inputs: {{ in: "{data}" }}
    outputs: {{ out: "{{i:in}}.sorted" }}
  - name: number
    command: "echo number >> {{p:log}}; cat -n {{i:in}} > {{o:out}}"
    params: {{ log: "{log}" }}
    inputs: {{ in: "{data}.sorted" }}
    outputs: {{ out: "{{i:in}}.numbered" }}
"#,
        data = data,
        log = log
    );
    (write_workflow(dir, &yaml), data, log)
}

/// Test: A second run over complete outputs executes nothing.
#[tokio::test]
async fn test_rerun_skips_everything() {
    let dir = TempDir::new().unwrap();
    let (file, data, log) = pipeline(&dir);

    let (_, bus) = recording_bus();
    load_workflow(&file, bus).unwrap().run().await.unwrap();
    let first = std::fs::read_to_string(format!("{}.sorted.numbered", data)).unwrap();

    let (recorder, bus) = recording_bus();
    let report = load_workflow(&file, bus).unwrap().run().await.unwrap();

    assert_eq!(report.skipped_count(), 2);
    assert_eq!(report.executed_count(), 0);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "sort\nnumber\n");
    assert_eq!(
        std::fs::read_to_string(format!("{}.sorted.numbered", data)).unwrap(),
        first
    );
    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::CommandExecuting { .. }))
            .await,
        0
    );
}

/// Test: Removing a downstream output re-runs only that task, with full lineage.
#[tokio::test]
async fn test_partial_rerun_reconstructs_lineage() {
    let dir = TempDir::new().unwrap();
    let (file, data, log) = pipeline(&dir);
    let numbered = format!("{}.sorted.numbered", data);

    let (_, bus) = recording_bus();
    let first = load_workflow(&file, bus).unwrap();
    first.run().await.unwrap();
    let original = first
        .task("number")
        .unwrap()
        .output("out")
        .unwrap()
        .audit_info()
        .unwrap()
        .clone();

    std::fs::remove_file(&numbered).unwrap();
    std::fs::remove_file(format!("{}.audit.json", numbered)).unwrap();

    let (_, bus) = recording_bus();
    let second = load_workflow(&file, bus).unwrap();
    let report = second.run().await.unwrap();

    assert_eq!(
        report.outcome(second.task("sort").unwrap().name()),
        Some(TaskOutcome::Skipped)
    );
    assert_eq!(
        report.outcome(second.task("number").unwrap().name()),
        Some(TaskOutcome::Executed)
    );
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "sort\nnumber\nnumber\n"
    );

    let rebuilt = second
        .task("number")
        .unwrap()
        .output("out")
        .unwrap()
        .audit_info()
        .unwrap();
    assert_eq!(rebuilt.upstream, original.upstream);
    assert_eq!(rebuilt.lineage_depth(), 2);
}

/// Test: A leftover temp file blocks the task instead of being overwritten.
#[tokio::test]
async fn test_leftover_temp_file_skips_task() {
    let dir = TempDir::new().unwrap();
    let (file, data, log) = pipeline(&dir);
    let sorted_tmp = format!("{}.sorted.tmp", data);
    std::fs::write(&sorted_tmp, "partial").unwrap();

    let (recorder, bus) = recording_bus();
    let workflow = load_workflow(&file, bus).unwrap();
    let sort = workflow.task("sort").unwrap().clone();
    assert_eq!(sort.execute().await.unwrap(), TaskOutcome::Skipped);

    assert_eq!(std::fs::read_to_string(&sorted_tmp).unwrap(), "partial");
    assert!(!Path::new(&format!("{}.sorted", data)).exists());
    assert!(!Path::new(&log).exists());
    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::TempExists { .. }))
            .await,
        1
    );
}

/// Test: Re-running a finished streaming pipeline skips both ends of the pipe.
#[tokio::test]
async fn test_rerun_streaming_pipeline_skips_producer() {
    let dir = TempDir::new().unwrap();
    let nums = path_in(&dir, "nums.txt");
    let total = path_in(&dir, "total.txt");
    let yaml = format!(
        r#"
tasks:
  - name: gen
    command: "seq 1 100 > {{os:nums}}"
    outputs: {{ nums: {{ path: "{nums}", stream: true }} }}
  - name: sum
    command: "awk '{{s += $1}} END {{print s}}' {{i:nums}} > {{o:total}}"
    inputs: {{ nums: {{ path: "{nums}", stream: true }} }}
    outputs: {{ total: "{total}" }}
"#,
        nums = nums,
        total = total
    );
    let file = write_workflow(&dir, &yaml);

    let (_, bus) = recording_bus();
    let first = tokio::time::timeout(Duration::from_secs(10), async {
        load_workflow(&file, bus).unwrap().run().await
    })
    .await
    .expect("first run deadlocked")
    .unwrap();
    assert_eq!(first.executed_count(), 2);
    assert_eq!(std::fs::read_to_string(&total).unwrap().trim(), "5050");

    let (recorder, bus) = recording_bus();
    let second = tokio::time::timeout(Duration::from_secs(10), async {
        load_workflow(&file, bus).unwrap().run().await
    })
    .await
    .expect("rerun of a streaming pipeline deadlocked")
    .unwrap();

    assert_eq!(second.skipped_count(), 2);
    assert_eq!(
        recorder
            .count(|e| matches!(e, Event::CommandExecuting { .. }))
            .await,
        0
    );
    assert_eq!(std::fs::read_to_string(&total).unwrap().trim(), "5050");
}
