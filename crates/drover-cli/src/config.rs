//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::scheduler::SchedulerConfig;
use drover_store::config::StorageConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub reporting: ReportingSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Seconds between admit ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Collapse missed cron fires into one.
    #[serde(default)]
    pub coalesce: bool,
    /// Cap on emitted missed cron fires per task.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportingSection {
    /// Seconds between reporter drains.
    #[serde(default = "default_report_interval")]
    pub interval: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding the snapshot file.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogSection {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; empty logs to stderr only.
    #[serde(default)]
    pub filename: String,
    /// Rotate the log file once it grows past this size.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Rotated files kept as `<filename>.1` .. `<filename>.N`.
    #[serde(default = "default_log_backup_count")]
    pub backup_count: u32,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_concurrency() -> usize {
    5
}

fn default_max_instances() -> u32 {
    5
}

fn default_report_interval() -> u64 {
    30
}

fn default_storage_path() -> String {
    StorageConfig::DEFAULT_PATH.to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_backup_count() -> u32 {
    5
}

fn default_log_format() -> String {
    "text".to_owned()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
            coalesce: false,
            max_instances: default_max_instances(),
        }
    }
}

impl Default for ReportingSection {
    fn default() -> Self {
        Self {
            interval: default_report_interval(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filename: String::new(),
            max_bytes: default_log_max_bytes(),
            backup_count: default_log_backup_count(),
            format: default_log_format(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the default path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// CLI-level overrides applied on top of env and file values.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub storage_dir: Option<String>,
    pub poll_interval: Option<u64>,
    pub concurrency: Option<usize>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub scheduler: SchedulerConfig,
    pub reporting_interval: Duration,
    pub storage: StorageConfig,
    pub log: LogSection,
}

impl DroverConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > `DROVER_*` env var > config file > default.
    pub fn resolve(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let file = match config_file {
            // An explicitly named file must exist.
            Some(path) => Some(load_config(path)?),
            None => {
                let default = config_path();
                if default.exists() {
                    Some(load_config(&default)?)
                } else {
                    None
                }
            }
        };
        let file = file.unwrap_or_default();

        let storage_path = overrides
            .storage_dir
            .clone()
            .or_else(|| std::env::var("DROVER_STORAGE_PATH").ok())
            .unwrap_or(file.storage.path);
        let poll_interval = overrides
            .poll_interval
            .or_else(|| env_parse("DROVER_POLL_INTERVAL"))
            .unwrap_or(file.scheduler.poll_interval);
        let concurrency = overrides
            .concurrency
            .or_else(|| env_parse("DROVER_CONCURRENCY"))
            .unwrap_or(file.scheduler.concurrency);

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(poll_interval.max(1)),
            concurrency: concurrency.max(1),
            coalesce: file.scheduler.coalesce,
            max_instances: file.scheduler.max_instances,
            ..SchedulerConfig::default()
        };

        Ok(Self {
            scheduler,
            reporting_interval: Duration::from_secs(file.reporting.interval.max(1)),
            storage: StorageConfig::new(storage_path),
            log: file.log,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
