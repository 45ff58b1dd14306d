// CLI Commands
// Subcommand implementations and the collaborator wiring they share

pub mod daemon;
pub mod run;
pub mod runs;
pub mod validate;

use crate::output;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use batch_service::report::{ProgressReceiver, TaskEvent};
use batch_service::{
    deduplicate, DirectoryProvider, JobDescriptor, ShellStageConfig, ShellStages,
    StoreScopeResolver, TaskEnvironment, TaskSpec,
};

/// Options shared by every command that executes stages
#[derive(Args, Debug, Clone)]
pub struct StageArgs {
    /// Shell stage configuration (JSON); stages without a command are skipped
    #[arg(long, value_name = "FILE")]
    pub stages: Option<PathBuf>,
}

impl StageArgs {
    /// Directory-backed stores plus shell stages
    pub fn environment(&self) -> Result<TaskEnvironment> {
        let config = match &self.stages {
            Some(path) => ShellStageConfig::from_file(path)
                .wrap_err_with(|| format!("Cannot read stage configuration {}", path.display()))?,
            None => ShellStageConfig::default(),
        };
        Ok(TaskEnvironment::new(
            Arc::new(DirectoryProvider),
            Arc::new(ShellStages::new(config)),
        ))
    }
}

/// Read a job file: one descriptor per non-empty line
pub fn load_jobs(path: &Path) -> Result<Vec<JobDescriptor>> {
    if !path.exists() {
        bail!("Job file not found: {}", path.display());
    }
    let content =
        fs::read_to_string(path).wrap_err_with(|| format!("Cannot read {}", path.display()))?;

    let mut jobs = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let job = JobDescriptor::from_json_line(line)
            .wrap_err_with(|| format!("{}:{}: invalid job descriptor", path.display(), index + 1))?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Collapse redundant task descriptors; other unit kinds pass through after them
pub fn dedup_jobs(jobs: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
    let mut tasks: Vec<TaskSpec> = Vec::new();
    let mut others = Vec::new();
    for job in jobs {
        match job {
            JobDescriptor::Task(spec) => tasks.push(spec),
            other => others.push(other),
        }
    }

    let before = tasks.len();
    let provider = DirectoryProvider;
    let resolver = StoreScopeResolver::new(&provider);
    let merged = deduplicate(&tasks, |spec| resolver.resolve(spec));
    output::info(&format!("Deduplicated {} task(s) into {}", before, merged.len()));

    merged
        .into_iter()
        .map(JobDescriptor::from)
        .chain(others)
        .collect()
}

/// Print progress events until every sender is gone
pub async fn print_events(mut rx: ProgressReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            TaskEvent::Message(text) => output::status("Running", &text),
            TaskEvent::Error { context, message } => {
                if context.is_empty() {
                    output::error(&message);
                } else {
                    output::error(&format!("[{}] {}", context, message));
                }
            }
            TaskEvent::TaskCompleted {
                name,
                errors,
                duration,
            } => output::task_summary(&name, errors, duration),
            TaskEvent::Progress(_) | TaskEvent::Running(_) => {}
        }
    }
}
