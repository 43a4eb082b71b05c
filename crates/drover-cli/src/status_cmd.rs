//! The `drover status` command: an offline summary of the snapshot.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use drover_store::config::StorageConfig;
use drover_store::TaskStore;

/// Print a summary of the persisted task set.
pub fn run(storage: &StorageConfig) -> Result<()> {
    let store = TaskStore::open(storage).with_context(|| {
        format!(
            "could not read snapshot under {}",
            storage.dir().display()
        )
    })?;

    let mut tasks = store.list();
    tasks.sort_by_key(|t| t.created_at);
    let history = store.list_history();

    println!(
        "{} live task(s), {} history record(s)  [{}]",
        tasks.len(),
        history.len(),
        storage.snapshot_file().display()
    );

    if tasks.is_empty() {
        return Ok(());
    }

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in &tasks {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }
    let counts: Vec<String> = by_status
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!("{}", counts.join("  "));
    println!();

    for task in &tasks {
        let short_id = task.id.simple().to_string();
        println!(
            "{}  {:9}  {:6}  {}",
            &short_id[..8],
            task.status.to_string(),
            task.priority.to_string(),
            task.name
        );
    }

    Ok(())
}
