//! Snapshot persistence across store lifetimes.

use drover_store::config::StorageConfig;
use drover_store::{ScheduleKind, Task, TaskStatus, TaskStore};

fn temp_config() -> (StorageConfig, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    (StorageConfig::new(dir.path()), dir)
}

fn snapshot_json(config: &StorageConfig) -> serde_json::Value {
    let contents = std::fs::read_to_string(config.snapshot_file()).expect("snapshot readable");
    serde_json::from_str(&contents).expect("snapshot is json")
}

#[test]
fn every_mutation_writes_the_snapshot() {
    let (config, _guard) = temp_config();
    let store = TaskStore::open(&config).expect("open");

    let task = store
        .add(Task::new("persisted", ScheduleKind::Immediate))
        .expect("add");
    let json = snapshot_json(&config);
    assert_eq!(json.as_array().expect("array").len(), 1);
    assert_eq!(json[0]["status"], "PENDING");
    assert_eq!(json[0]["id"], task.id.to_string());

    store.update_status(task.id, TaskStatus::Queued).expect("queued");
    let json = snapshot_json(&config);
    assert_eq!(json[0]["status"], "QUEUED");
    assert_eq!(json[0]["version"], 2);
}

#[test]
fn terminal_state_is_persisted_twice() {
    let (config, _guard) = temp_config();
    let store = TaskStore::open(&config).expect("open");

    let task = store
        .add(Task::new("finished", ScheduleKind::Immediate))
        .expect("add");
    store.update_status(task.id, TaskStatus::Queued).expect("queued");
    store
        .update_status(task.id, TaskStatus::Running)
        .expect("running");
    store.update_status(task.id, TaskStatus::Done).expect("done");

    // The live record plus its history copy.
    let json = snapshot_json(&config);
    assert_eq!(json.as_array().expect("array").len(), 2);
    assert!(json.as_array().unwrap().iter().all(|t| t["status"] == "DONE"));
}

#[test]
fn reopen_preserves_record_fields() {
    let (config, _guard) = temp_config();

    let original = {
        let store = TaskStore::open(&config).expect("open");
        let mut task = Task::new("careful", ScheduleKind::Immediate);
        task.owner = Some("ops".to_owned());
        task.tags = vec!["echo".to_owned()];
        task.parameters = serde_json::json!({"depth": 3});
        let task = store.add(task).expect("add");
        store.update_status(task.id, TaskStatus::Queued).expect("queued");
        store.get(task.id).expect("get")
    };

    let store = TaskStore::open(&config).expect("reopen");
    let recovered = store.get(original.id).expect("get");
    assert_eq!(recovered, original);
}

#[test]
fn wire_format_uses_canonical_encodings() {
    let (config, _guard) = temp_config();
    let store = TaskStore::open(&config).expect("open");

    let mut task = Task::new("encoded", ScheduleKind::Scheduled);
    task.cron_expr = Some("0 4 * * *".to_owned());
    task.dependencies = vec![uuid::Uuid::new_v4()];
    let task = store.add(task).expect("add");

    let json = snapshot_json(&config);
    let record = &json[0];
    // UUIDs as canonical strings.
    assert_eq!(record["id"], task.id.to_string());
    assert_eq!(record["dependencies"][0], task.dependencies[0].to_string());
    // Enums as upper-case literals.
    assert_eq!(record["schedule_kind"], "SCHEDULED");
    assert_eq!(record["priority"], "MEDIUM");
    // Timestamps parse back as RFC 3339.
    let created = record["created_at"].as_str().expect("created_at string");
    assert!(chrono::DateTime::parse_from_rfc3339(created).is_ok());
}
