// Batch Driver
// Validates a list of units, sums their subtasks and runs them through a background executor

use super::executor::{BackgroundExecutor, ExecutionOutcome, ExecutorError, SubUnits};
use crate::report::ProgressSink;
use crate::task::{Schedulable, TaskError};

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    /// At least one unit failed validation; nothing ran
    #[error("{} task(s) failed validation: {}", names.len(), names.join("; "))]
    InvalidTasks { names: Vec<String> },

    /// The executor thread was lost
    #[error("Executor thread failed: {0}")]
    Join(String),
}

/// A validated batch of units, run in submission order
pub struct BatchDriver {
    units: Vec<Box<dyn Schedulable>>,
    total_subtasks: usize,
}

impl std::fmt::Debug for BatchDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDriver")
            .field("units", &self.units.len())
            .field("total_subtasks", &self.total_subtasks)
            .finish()
    }
}

impl BatchDriver {
    /// Validate every unit; a single invalid unit rejects the whole batch
    pub fn new(mut units: Vec<Box<dyn Schedulable>>) -> Result<Self, BatchError> {
        let mut invalid = Vec::new();
        for unit in units.iter_mut() {
            if !unit.is_valid() {
                for flat in unit.errors().flatten() {
                    error!(task = %unit.describe(), "{}", flat);
                }
                invalid.push(unit.describe());
            }
        }
        if !invalid.is_empty() {
            return Err(BatchError::InvalidTasks { names: invalid });
        }

        let total_subtasks = units.iter().map(|u| u.count_subtasks()).sum();
        info!(tasks = units.len(), subtasks = total_subtasks, "Batch validated");
        Ok(Self {
            units,
            total_subtasks,
        })
    }

    /// Validate every unit and batch the valid ones; the rejected units come
    /// back with their validation errors, in submission order
    pub fn split_valid(units: Vec<Box<dyn Schedulable>>) -> (Self, Vec<Box<dyn Schedulable>>) {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        for mut unit in units {
            if unit.is_valid() {
                valid.push(unit);
            } else {
                warn!(task = %unit.describe(), errors = unit.errors().len(), "Task failed validation");
                rejected.push(unit);
            }
        }
        (Self::from_validated(valid), rejected)
    }

    /// Batch over units the caller already validated
    pub fn from_validated(units: Vec<Box<dyn Schedulable>>) -> Self {
        let total_subtasks = units.iter().map(|u| u.count_subtasks()).sum();
        Self {
            units,
            total_subtasks,
        }
    }

    pub fn total_subtasks(&self) -> usize {
        self.total_subtasks
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[Box<dyn Schedulable>] {
        &self.units
    }

    pub fn into_units(self) -> Vec<Box<dyn Schedulable>> {
        self.units
    }

    /// Executor over this batch, for callers that want hooks or cancellation
    pub fn executor(self, sink: Arc<ProgressSink>) -> BackgroundExecutor<BatchDriver> {
        BackgroundExecutor::new(self, sink)
    }

    /// Run the whole batch on the blocking pool and wait for it
    pub async fn execute(self, sink: Arc<ProgressSink>) -> Result<ExecutionOutcome<BatchDriver>, BatchError> {
        self.executor(sink)
            .spawn()
            .await
            .map_err(|e| BatchError::Join(e.to_string()))
    }
}

impl SubUnits for BatchDriver {
    fn count(&self) -> usize {
        self.units.len()
    }

    fn run(&mut self, index: usize, sink: &ProgressSink) -> Result<Option<String>, ExecutorError> {
        let total = self.units.len();
        let Some(unit) = self.units.get_mut(index) else {
            return Err(ExecutorError::Failed {
                index,
                message: "no such task".into(),
            });
        };

        let started = Instant::now();
        sink.set_task_counter(index, total);
        sink.message(&format!("Running task {}/{}: {}", index + 1, total, unit.describe()));
        unit.run_task(sink);
        unit.publish_errors(sink);

        let errors = unit.errors().flatten().len();
        if let Some(ui) = sink.ui() {
            ui.task_completed(&unit.describe(), errors, started.elapsed());
        }
        Ok(None)
    }

    fn panicked(&mut self, index: usize, message: &str) {
        if let Some(unit) = self.units.get_mut(index) {
            unit.errors_mut().add("", TaskError::Panicked(message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{environment, experiment, MemoryProvider, RecordingStages};
    use crate::report::{progress_channel, ChannelUi, TaskEvent};
    use crate::task::{Task, TaskSpec};

    fn units(provider: &MemoryProvider, stages: &Arc<RecordingStages>, specs: Vec<TaskSpec>) -> Vec<Box<dyn Schedulable>> {
        specs
            .into_iter()
            .map(|spec| Box::new(Task::new(spec, environment(provider, stages))) as Box<dyn Schedulable>)
            .collect()
    }

    #[test]
    fn test_one_invalid_task_rejects_batch() {
        let provider = MemoryProvider::new(experiment(2, 1));
        let stages = Arc::new(RecordingStages::new());
        let batch = units(
            &provider,
            &stages,
            vec![
                TaskSpec::new("exp", "/d").with_actions(true, false, false, false),
                TaskSpec::new("exp", "/d").with_positions([9]).with_actions(true, false, false, false),
            ],
        );

        match BatchDriver::new(batch) {
            Err(BatchError::InvalidTasks { names }) => {
                assert_eq!(names.len(), 1);
                assert!(names[0].contains("positions=[9]"));
            }
            other => panic!("expected invalid batch, got {:?}", other.map(|d| d.len())),
        }
        assert!(stages.calls().is_empty());
    }

    #[tokio::test]
    async fn test_split_valid_runs_only_valid_units() {
        let provider = MemoryProvider::new(experiment(2, 1));
        let stages = Arc::new(RecordingStages::new());
        let batch = units(
            &provider,
            &stages,
            vec![
                TaskSpec::new("exp", "/d").with_positions([9]).with_actions(false, false, false, true),
                TaskSpec::new("exp", "/d").with_positions([1]).with_actions(false, false, false, true),
            ],
        );

        let (driver, rejected) = BatchDriver::split_valid(batch);
        assert_eq!(driver.len(), 1);
        assert_eq!(driver.total_subtasks(), 1);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].describe().contains("positions=[9]"));
        assert!(!rejected[0].errors().is_empty());

        let outcome = driver.execute(Arc::new(ProgressSink::silent())).await.unwrap();
        assert!(outcome.is_complete());
        let measured: Vec<String> = stages
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("measure"))
            .collect();
        assert_eq!(measured, vec!["measure pos1 eraseAll"]);
    }

    #[tokio::test]
    async fn test_runs_units_in_order_and_publishes_errors() {
        let provider = MemoryProvider::new(experiment(2, 2));
        let stages = Arc::new(RecordingStages::new().fail_structure(1, 0));
        let batch = units(
            &provider,
            &stages,
            vec![
                TaskSpec::new("exp", "/d")
                    .with_positions([1])
                    .with_structures([0])
                    .with_actions(false, false, true, false),
                TaskSpec::new("exp", "/d")
                    .with_positions([0])
                    .with_actions(false, false, false, true),
            ],
        );

        let driver = BatchDriver::new(batch).unwrap();
        assert_eq!(driver.total_subtasks(), 2);

        let (tx, mut rx) = progress_channel();
        let sink = Arc::new(ProgressSink::new(Some(Arc::new(ChannelUi::new(tx)))));
        let outcome = driver.execute(sink).await.unwrap();

        assert!(outcome.is_complete());
        let calls = stages.calls();
        let first = calls.iter().position(|c| c.starts_with("track pos1 s0")).unwrap();
        let second = calls.iter().position(|c| c == "measure pos0 eraseAll").unwrap();
        assert!(first < second);

        let units = outcome.work.into_units();
        assert_eq!(units[0].errors().flatten().len(), 1);
        assert!(units[1].errors().is_empty());

        let mut errors = Vec::new();
        let mut completed = Vec::new();
        let mut last_progress = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                TaskEvent::Error { context, .. } => errors.push(context),
                TaskEvent::TaskCompleted { errors, .. } => completed.push(errors),
                TaskEvent::Progress(p) => last_progress = p,
                _ => {}
            }
        }
        assert_eq!(errors, vec!["position pos1 / structure 0"]);
        assert_eq!(completed, vec![1, 0]);
        assert_eq!(last_progress, 100);
    }

    #[tokio::test]
    async fn test_panicking_unit_halts_batch_after_cleanup() {
        let provider = MemoryProvider::new(experiment(1, 1));
        let stages = Arc::new(RecordingStages::new().panic_on(0));
        let batch = units(
            &provider,
            &stages,
            vec![
                TaskSpec::new("exp", "/d").with_actions(true, false, false, false),
                TaskSpec::new("exp", "/d").with_actions(false, false, false, true),
            ],
        );

        let hook_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = hook_ran.clone();
        let outcome = BatchDriver::new(batch)
            .unwrap()
            .executor(Arc::new(ProgressSink::silent()))
            .on_complete(move |_| flag.store(true, std::sync::atomic::Ordering::SeqCst))
            .spawn()
            .await
            .unwrap();

        assert!(matches!(outcome.failure, Some(ExecutorError::Panicked { index: 0, .. })));
        assert!(hook_ran.load(std::sync::atomic::Ordering::SeqCst));
        let units = outcome.work.units();
        assert!(units[0].errors().mentions("Task panicked"));
        assert!(units[1].errors().is_empty());
        assert_eq!(stages.calls(), vec!["release pos0"]);
    }
}
