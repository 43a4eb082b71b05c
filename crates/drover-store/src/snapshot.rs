//! Snapshot file reading and writing.
//!
//! The snapshot is a single JSON document containing the full task set
//! (live and history) as an array of task objects. Writes go through a
//! temp file in the same directory followed by a rename so a crash never
//! leaves a half-written snapshot behind. Readers tolerate unknown fields
//! so snapshots survive schema additions in either direction.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::models::Task;

/// Serialize `tasks` to `path` atomically, creating the parent directory
/// if needed.
pub fn write_snapshot(path: &Path, tasks: &[Task]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;
    }

    let contents =
        serde_json::to_string_pretty(tasks).context("failed to serialize tasks snapshot")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .with_context(|| format!("failed to write snapshot temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into place at {}", path.display()))?;

    Ok(())
}

/// Load tasks from a snapshot file.
///
/// Returns `Ok(None)` when the file does not exist (a fresh install, not
/// an error). Unknown fields in the records are ignored.
pub fn load_snapshot(path: &Path) -> Result<Option<Vec<Task>>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse snapshot file {}", path.display()))?;

    Ok(Some(tasks))
}
