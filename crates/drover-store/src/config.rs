use std::env;
use std::path::{Path, PathBuf};

/// Storage configuration.
///
/// Points at the directory holding the snapshot file. Reads from the
/// `DROVER_STORAGE_PATH` environment variable, falling back to
/// `task_storage` when unset.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory the snapshot file lives in.
    pub path: PathBuf,
}

impl StorageConfig {
    /// The default storage directory used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "task_storage";

    /// Name of the snapshot file within the storage directory.
    pub const SNAPSHOT_FILE: &str = "tasks_snapshot.json";

    /// Build a config from the environment.
    ///
    /// Priority: `DROVER_STORAGE_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let path = env::var("DROVER_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { path }
    }

    /// Build a config from an explicit directory (useful for tests and CLI flags).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Full path of the snapshot file.
    pub fn snapshot_file(&self) -> PathBuf {
        self.path.join(Self::SNAPSHOT_FILE)
    }

    /// The storage directory.
    pub fn dir(&self) -> &Path {
        &self.path
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
