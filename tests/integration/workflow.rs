//! End-to-end workflow tests.
//!
//! Tests that load a workflow file, build its tasks and run them to
//! committed outputs.

use crate::common::{files_with_suffix, path_in, recording_bus, write_workflow};
use sciexec::{load_workflow, Event, TaskBuilder, TaskId, TaskOutcome, Workflow};
use std::sync::Arc;
use tempfile::TempDir;

enum Stage {
    Started,
    Committed,
}

fn first_index(events: &[Event], task: &str, stage: Stage) -> usize {
    events
        .iter()
        .position(|e| {
            e.task_id().as_str() == task
                && match stage {
                    Stage::Started => matches!(e, Event::TaskStarted { .. }),
                    Stage::Committed => matches!(e, Event::OutputCommitted { .. }),
                }
        })
        .unwrap()
}

/// Test: A three-stage file pipeline runs in dependency order.
#[tokio::test]
async fn test_three_stage_pipeline_from_yaml() {
    let dir = TempDir::new().unwrap();
    let data = path_in(&dir, "words.txt");
    std::fs::write(&data, "pear\napple\npear\nfig\n").unwrap();

    let yaml = format!(
        r#"
tasks:
  - name: count
    command: "wc -l < {{i:in}} | tr -d ' ' > {{o:count}}"
    inputs: {{ in: "{data}.uniq" }}
    outputs: {{ count: "{{i:in}}.count" }}
  - name: uniq
    command: "uniq {{i:in}} > {{o:out}}"
    inputs: {{ in: "{data}.sorted" }}
    outputs: {{ out: "{data}.uniq" }}
  - name: sort
    command: "sort {{i:in}} > {{o:sorted}}"
    prepend: "env LC_ALL=C"
    inputs: {{ in: "{data}" }}
    outputs: {{ sorted: "{{i:in}}.sorted" }}
"#,
        data = data
    );
    let file = write_workflow(&dir, &yaml);
    let (recorder, bus) = recording_bus();

    let workflow = load_workflow(&file, bus).unwrap();
    let report = workflow.run().await.unwrap();

    assert_eq!(report.executed_count(), 3);
    assert_eq!(
        std::fs::read_to_string(format!("{}.uniq", data)).unwrap(),
        "apple\nfig\npear\n"
    );
    assert_eq!(
        std::fs::read_to_string(format!("{}.uniq.count", data))
            .unwrap()
            .trim(),
        "3"
    );
    assert!(files_with_suffix(dir.path(), ".tmp").is_empty());
    assert_eq!(files_with_suffix(dir.path(), ".audit.json").len(), 3);
    assert!(workflow
        .task("sort")
        .unwrap()
        .command()
        .starts_with("env LC_ALL=C sort "));

    // Each consumer started only after its producer committed.
    let events = recorder.events().await;
    let sort_committed = first_index(&events, "sort", Stage::Committed);
    let uniq_started = first_index(&events, "uniq", Stage::Started);
    let uniq_committed = first_index(&events, "uniq", Stage::Committed);
    let count_started = first_index(&events, "count", Stage::Started);
    assert!(sort_committed < uniq_started);
    assert!(uniq_committed < count_started);
}

/// Test: Independent tasks run concurrently.
#[tokio::test]
async fn test_independent_tasks_run_concurrently() {
    let dir = TempDir::new().unwrap();
    let (_, bus) = recording_bus();
    let mut workflow = Workflow::new();
    for name in ["a", "b", "c", "d"] {
        let task = TaskBuilder::new(name, "sleep 0.3; echo {p:name} > {o:out}")
            .param("name", name)
            .output_path("out", path_in(&dir, &format!("{}.txt", name)))
            .events(bus.clone())
            .build()
            .unwrap();
        workflow.add(Arc::new(task), vec![]);
    }

    let report = workflow.run().await.unwrap();

    assert_eq!(report.executed_count(), 4);
    assert!(
        report.duration < std::time::Duration::from_millis(1100),
        "tasks appear to have run sequentially: {:?}",
        report.duration
    );
    assert_eq!(
        report.outcome(&TaskId::new("c")),
        Some(TaskOutcome::Executed)
    );
}

/// Test: Params in path templates shape output names.
#[tokio::test]
async fn test_param_driven_output_paths() {
    let dir = TempDir::new().unwrap();
    let data = path_in(&dir, "seq.txt");
    std::fs::write(&data, "1\n2\n3\n4\n5\n").unwrap();
    let yaml = format!(
        r#"
tasks:
  - name: head
    command: "head -n {{p:n}} {{i:in}} > {{o:out}}"
    params: {{ n: "2" }}
    inputs: {{ in: "{data}" }}
    outputs: {{ out: "{{i:in}}.head{{p:n}}" }}
"#,
        data = data
    );
    let file = write_workflow(&dir, &yaml);
    let (_, bus) = recording_bus();

    let workflow = load_workflow(&file, bus).unwrap();
    workflow.run().await.unwrap();

    let out = format!("{}.head2", data);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "1\n2\n");
    let task = workflow.task("head").unwrap();
    assert_eq!(
        task.output("out").unwrap().audit_info().unwrap().params["n"],
        "2"
    );
}
