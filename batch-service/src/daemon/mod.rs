// Job Queue Daemon
// Watches a directory for job files, runs their units one at a time and relocates finished files

pub mod config;

pub use config::{DaemonConfig, DEFAULT_IDLE_INTERVAL, ERRORS_DIR, LOGS_DIR, PARSED_JOBS_DIR};

use crate::error::{ServiceError, ServiceResult};
use crate::execution::BatchDriver;
use crate::report::ProgressSink;
use crate::task::{JobDescriptor, Schedulable, TaskEnvironment, TaskLog};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stop controls for a running daemon
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl DaemonHandle {
    /// Stop watching; queued units still run
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop now; the running unit observes it before its next sub-unit
    pub fn cancel(&self) {
        self.stop.cancel();
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// What a daemon did before it exited
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonReport {
    /// Units that ran to the end
    pub executed: usize,
    /// Units that were invalid, failed or left errors behind
    pub failed: usize,
    /// Job files moved out of the watch directory, in order
    pub relocated: Vec<PathBuf>,
}

struct PendingJob {
    unit: Box<dyn Schedulable>,
    source: PathBuf,
}

#[derive(Debug, Default)]
struct SourceState {
    pending: usize,
    errored: bool,
}

/// Filesystem job queue.
///
/// Every `*.json` file dropped in the watch directory holds one job descriptor
/// per line. Units run strictly one after another, in file name then line
/// order. A file is moved to `ParsedJobs/` or `Errors/` once none of its units
/// remain pending; `Errors/` if any line was malformed or any unit errored.
pub struct JobQueueDaemon {
    config: DaemonConfig,
    env: TaskEnvironment,
    sink: Arc<ProgressSink>,
    queue: VecDeque<PendingJob>,
    sources: HashMap<PathBuf, SourceState>,
    seen: HashSet<PathBuf>,
    executed: HashSet<PathBuf>,
    stop: CancellationToken,
    cancel: CancellationToken,
    report: DaemonReport,
}

impl JobQueueDaemon {
    pub fn new(config: DaemonConfig, env: TaskEnvironment, sink: Arc<ProgressSink>) -> Self {
        Self {
            config,
            env,
            sink,
            queue: VecDeque::new(),
            sources: HashMap::new(),
            seen: HashSet::new(),
            executed: HashSet::new(),
            stop: CancellationToken::new(),
            cancel: CancellationToken::new(),
            report: DaemonReport::default(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop: self.stop.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Units waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pick up unseen job files; returns the number of units enqueued
    pub fn scan(&mut self) -> ServiceResult<usize> {
        self.config.ensure_dirs()?;

        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.watch_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .filter(|path| !self.seen.contains(path))
            .collect();
        files.sort();

        let mut enqueued = 0;
        for path in files {
            self.seen.insert(path.clone());
            enqueued += self.enqueue_file(&path);
        }
        Ok(enqueued)
    }

    fn enqueue_file(&mut self, path: &Path) -> usize {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path.display(), "Cannot read job file: {}", e);
                self.relocate(path, true);
                return 0;
            }
        };

        let mut state = SourceState::default();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match JobDescriptor::from_json_line(line) {
                Ok(job) => {
                    let unit = job.into_unit(&self.env);
                    debug!(file = %path.display(), line = index + 1, task = %unit.describe(), "Job queued");
                    self.queue.push_back(PendingJob {
                        unit,
                        source: path.to_path_buf(),
                    });
                    state.pending += 1;
                }
                Err(e) => {
                    let err = ServiceError::invalid_job(index + 1, e.to_string());
                    warn!(file = %path.display(), "{}", err);
                    self.sink.warning(&format!("{}: {}", path.display(), err));
                    match self.open_log(path) {
                        Ok(mut log) => log.line("ERROR", &err.to_string()),
                        Err(e) => warn!(file = %path.display(), "Cannot open job log: {}", e),
                    }
                    state.errored = true;
                }
            }
        }

        let enqueued = state.pending;
        info!(file = %path.display(), jobs = enqueued, malformed = state.errored, "Job file parsed");
        if enqueued == 0 {
            self.relocate(path, state.errored);
        } else {
            self.sources.insert(path.to_path_buf(), state);
        }
        enqueued
    }

    /// Run until stopped with an empty queue, or cancelled
    pub async fn run(mut self) -> ServiceResult<DaemonReport> {
        self.config.ensure_dirs()?;
        info!(dir = %self.config.watch_dir.display(), "Watching for job files");

        loop {
            if self.cancel.is_cancelled() {
                info!(pending = self.queue.len(), "Daemon cancelled");
                break;
            }
            if let Some(job) = self.queue.pop_front() {
                self.run_job(job).await;
                continue;
            }
            if self.stop.is_cancelled() {
                info!("Daemon stopped");
                break;
            }

            let found = match self.scan() {
                Ok(found) => found,
                Err(e) => {
                    warn!(dir = %self.config.watch_dir.display(), "Scan failed: {}", e);
                    0
                }
            };
            if found == 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = self.stop.cancelled() => {}
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                }
            }
        }

        Ok(self.report)
    }

    async fn run_job(&mut self, job: PendingJob) {
        let PendingJob { mut unit, source } = job;
        let name = unit.describe();
        match self.open_log(&source) {
            Ok(log) => unit.set_log(Some(log)),
            Err(e) => warn!(file = %source.display(), "Cannot open job log: {}", e),
        }

        let errored = if unit.is_valid() {
            match self.execute(unit).await {
                Some(errored) => errored,
                None => {
                    // Cancelled before it started; the file stays in the watch directory
                    debug!(task = %name, "Job not started");
                    return;
                }
            }
        } else {
            warn!(file = %source.display(), task = %name, "Invalid job skipped");
            unit.publish_errors(&self.sink);
            unit.set_log(None);
            unit.release();
            true
        };

        if errored {
            self.report.failed += 1;
        }
        self.finish_job(&source, errored);
    }

    /// Run one validated unit on the executor thread; `None` when it never started
    async fn execute(&mut self, unit: Box<dyn Schedulable>) -> Option<bool> {
        let handle = BatchDriver::from_validated(vec![unit])
            .executor(self.sink.clone())
            .with_cancellation(self.cancel.clone())
            .spawn();

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = ServiceError::Run(e.to_string());
                error!("{}", err);
                return Some(true);
            }
        };

        let started = outcome.completed > 0 || outcome.failure.is_some();
        let mut errored = outcome.failure.is_some();
        for mut unit in outcome.work.into_units() {
            errored |= !unit.errors().is_empty();
            unit.set_log(None);
            unit.release();
        }
        if !started {
            return None;
        }
        if outcome.failure.is_none() {
            self.report.executed += 1;
        }
        Some(errored)
    }

    fn finish_job(&mut self, source: &Path, errored: bool) {
        let Some(state) = self.sources.get_mut(source) else {
            return;
        };
        state.errored |= errored;
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            let errored = state.errored;
            self.sources.remove(source);
            self.relocate(source, errored);
        }
    }

    /// Job log of a file: truncated on the file's first use, appended afterward
    fn open_log(&mut self, source: &Path) -> io::Result<TaskLog> {
        let append = !self.executed.insert(source.to_path_buf());
        TaskLog::open(self.config.log_path(source), append)
    }

    fn relocate(&mut self, source: &Path, errored: bool) {
        let dir = if errored {
            self.config.errors_dir()
        } else {
            self.config.parsed_jobs_dir()
        };
        let Some(file_name) = source.file_name() else {
            return;
        };
        let target = dir.join(file_name);
        match fs::rename(source, &target) {
            Ok(()) => {
                info!(file = %source.display(), to = %target.display(), "Job file relocated");
                self.report.relocated.push(target);
                self.seen.remove(source);
            }
            // Stays in `seen`: a file whose units already ran is never queued again
            Err(e) => error!(
                file = %source.display(),
                to = %target.display(),
                "Cannot relocate job file: {}",
                e
            ),
        }
    }
}
