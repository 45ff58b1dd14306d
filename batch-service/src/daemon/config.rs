// Daemon Configuration
// Watch directory layout and polling interval

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relocated job files that ran cleanly
pub const PARSED_JOBS_DIR: &str = "ParsedJobs";

/// Relocated job files with a malformed line or a failed job
pub const ERRORS_DIR: &str = "Errors";

/// Per-file job logs
pub const LOGS_DIR: &str = "Logs";

/// Sleep between two scans of an idle watch directory
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for the job queue daemon
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory scanned for `*.json` job files (default: ~/.microbatch/jobs/)
    pub watch_dir: PathBuf,

    /// How long to sleep when there is nothing to do
    pub idle_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let watch_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".microbatch")
            .join("jobs");

        Self {
            watch_dir,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

impl DaemonConfig {
    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = dir.into();
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn parsed_jobs_dir(&self) -> PathBuf {
        self.watch_dir.join(PARSED_JOBS_DIR)
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.watch_dir.join(ERRORS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.watch_dir.join(LOGS_DIR)
    }

    /// Log file of a job file: `Logs/<stem>.log`
    pub fn log_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jobs".to_string());
        self.logs_dir().join(format!("{}.log", stem))
    }

    /// Create the watch directory and its managed subdirectories
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.watch_dir)?;
        fs::create_dir_all(self.parsed_jobs_dir())?;
        fs::create_dir_all(self.errors_dir())?;
        fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
