// Task Log
// Per-task log target the daemon redirects a job's output to

use crate::report::ErrorAggregate;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Append-only text log attached to one task for the duration of a run
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TaskLog {
    /// Open the log, truncating it unless `append` is set
    pub fn open(path: impl AsRef<Path>, append: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line; failures to write the log never fail the task
    pub fn line(&mut self, level: &str, text: &str) {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let _ = writeln!(self.writer, "{} {:<5} {}", secs, level, text);
        let _ = self.writer.flush();
    }

    /// Write every flattened error, with its filtered trace frames
    pub fn errors(&mut self, errors: &ErrorAggregate) {
        for flat in errors.flatten() {
            self.line("ERROR", &flat.to_string());
            for frame in &flat.frames {
                self.line("ERROR", &format!("    at {}", frame));
            }
        }
    }
}
