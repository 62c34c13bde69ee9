//! Provenance integration tests.
//!
//! Tests that every committed output carries a complete lineage record, on
//! disk and in memory.

use crate::common::{path_in, recording_bus};
use sciexec::testing::WriteContent;
use sciexec::{AuditInfo, InformationPacket, TaskBuilder};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

/// Test: A record names the command, params and every upstream input.
#[tokio::test]
async fn test_record_covers_every_input() {
    let dir = TempDir::new().unwrap();
    let (_, bus) = recording_bus();

    let left = TaskBuilder::new("left", "")
        .output_path("out", path_in(&dir, "left.txt"))
        .custom_execute(Arc::new(WriteContent::new("out", "l\n")))
        .events(bus.clone())
        .build()
        .unwrap();
    let right = TaskBuilder::new("right", "")
        .output_path("out", path_in(&dir, "right.txt"))
        .custom_execute(Arc::new(WriteContent::new("out", "r\n")))
        .events(bus.clone())
        .build()
        .unwrap();
    left.execute().await.unwrap();
    right.execute().await.unwrap();

    let raw = path_in(&dir, "raw.txt");
    std::fs::write(&raw, "x\n").unwrap();
    let join = TaskBuilder::new("join", "cat {i:a} {i:b} {i:raw} | head -n {p:n} > {o:out}")
        .input("a", left.output("out").unwrap().clone())
        .input("b", right.output("out").unwrap().clone())
        .input("raw", Arc::new(InformationPacket::new(raw.clone())))
        .output("out", |t| format!("{}.joined", t.in_path("a")))
        .param("n", "2")
        .events(bus)
        .build()
        .unwrap();
    join.execute().await.unwrap();

    let out = join.output("out").unwrap();
    assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "l\nr\n");

    let on_disk = AuditInfo::from_file(out.audit_path()).unwrap();
    assert_eq!(&on_disk, out.audit_info().unwrap());
    assert_eq!(on_disk.command, join.command());
    assert_eq!(on_disk.params["n"], "2");
    assert_eq!(on_disk.task_name.as_deref(), Some("join"));
    assert!(on_disk.started_at.unwrap() <= on_disk.finished_at.unwrap());

    let inputs: Vec<&str> = on_disk.upstream.keys().map(String::as_str).collect();
    let mut expected = vec![
        left.output("out").unwrap().path(),
        right.output("out").unwrap().path(),
        raw.as_str(),
    ];
    expected.sort();
    assert_eq!(inputs, expected);
    assert_eq!(
        on_disk.upstream[left.output("out").unwrap().path()].command,
        "write 2 bytes to out"
    );
    assert!(on_disk.upstream[&raw].is_empty());
}

/// Test: Sidecars are plain JSON with stable field names.
#[tokio::test]
async fn test_sidecar_json_shape() {
    let dir = TempDir::new().unwrap();
    let (_, bus) = recording_bus();
    let task = TaskBuilder::new("echo", "echo {p:msg} > {o:out}")
        .param("msg", "hi")
        .output_path("out", path_in(&dir, "msg.txt"))
        .events(bus)
        .build()
        .unwrap();
    task.execute().await.unwrap();

    let raw = std::fs::read_to_string(task.output("out").unwrap().audit_path()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(json["command"], task.command());
    assert_eq!(json["params"]["msg"], "hi");
    assert!(json["execution_time_millis"].is_u64());
    assert!(json["upstream"].as_object().unwrap().is_empty());
    assert_eq!(json["task_name"], "echo");
}

/// Test: A data file loaded from disk brings its lineage along.
#[tokio::test]
async fn test_existing_file_reloads_lineage() {
    let dir = TempDir::new().unwrap();
    let (_, bus) = recording_bus();
    let path = path_in(&dir, "produced.txt");
    let task = TaskBuilder::new("produce", "echo data > {o:out}")
        .output_path("out", path.clone())
        .events(bus)
        .build()
        .unwrap();
    task.execute().await.unwrap();

    let reopened = InformationPacket::from_existing(path.as_str()).unwrap();

    assert_eq!(reopened.audit_info(), task.output("out").unwrap().audit_info());
}

/// Test: `sx show-audit` prints the lineage tree of a data file.
#[tokio::test]
async fn test_show_audit_command() {
    let dir = TempDir::new().unwrap();
    let (_, bus) = recording_bus();
    let raw = path_in(&dir, "raw.txt");
    std::fs::write(&raw, "b\na\n").unwrap();
    let task = TaskBuilder::new("sort", "sort {i:in} > {o:out}")
        .input("in", Arc::new(InformationPacket::new(raw.clone())))
        .output("out", |t| format!("{}.sorted", t.in_path("in")))
        .events(bus)
        .build()
        .unwrap();
    task.execute().await.unwrap();
    let sorted = task.output("out").unwrap().path().to_string();

    let output = Command::new(env!("CARGO_BIN_EXE_sx"))
        .args(["show-audit", &sorted])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("command:  {}", task.command())));
    assert!(stdout.contains("task:     sort"));
    assert!(stdout.contains(&raw));
    assert!(stdout.contains("(source file)"));

    let missing = Command::new(env!("CARGO_BIN_EXE_sx"))
        .args(["show-audit", &raw])
        .output()
        .unwrap();
    assert!(!missing.status.success());
}
