// Task Module
// A unit of batch work: serializable descriptor plus the stateful runtime that validates and executes it

pub mod error;
pub mod execute;
pub mod kind;
pub mod log;
pub mod spec;
pub mod validate;

// Re-export key types
pub use error::TaskError;
pub use kind::{JobDescriptor, Schedulable};
pub use log::TaskLog;
pub use spec::{
    Bounds, DatasetExtraction, ExportOptions, FeatureSpec, MeasurementExtraction, MeasurementMode,
    RawDatasetExtraction, TaskSpec,
};

use crate::report::{ErrorAggregate, ProgressSink};
use crate::stages::{DatasetExtractor, StageError, StageRunner};
use crate::store::{ExperimentConfig, ExperimentStore, StoreProvider};

use std::sync::Arc;
use tracing::debug;

/// Collaborators a task needs at runtime, injected once at startup
#[derive(Clone)]
pub struct TaskEnvironment {
    pub provider: Arc<dyn StoreProvider>,
    pub stages: Arc<dyn StageRunner>,
    /// Optional dataset extraction module; its absence is a recoverable error
    pub dataset_extractor: Option<Arc<dyn DatasetExtractor>>,
}

impl TaskEnvironment {
    pub fn new(provider: Arc<dyn StoreProvider>, stages: Arc<dyn StageRunner>) -> Self {
        Self {
            provider,
            stages,
            dataset_extractor: None,
        }
    }

    pub fn with_dataset_extractor(mut self, extractor: Arc<dyn DatasetExtractor>) -> Self {
        self.dataset_extractor = Some(extractor);
        self
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unvalidated,
    Validated,
    Invalid,
    Running,
    /// Finished; per-position failures live in the error aggregate
    Done,
}

/// Runtime wrapper around a [`TaskSpec`]
pub struct Task {
    spec: TaskSpec,
    env: TaskEnvironment,
    state: TaskState,
    store: Option<Box<dyn ExperimentStore>>,
    keep_store: bool,
    /// Configuration seen by the last validation, kept after the handle closes
    config: Option<ExperimentConfig>,
    positions: Option<Vec<usize>>,
    structures: Option<Vec<usize>>,
    locked: Vec<String>,
    errors: ErrorAggregate,
    warnings: Vec<String>,
    log: Option<TaskLog>,
}

impl Task {
    pub fn new(spec: TaskSpec, env: TaskEnvironment) -> Self {
        Self {
            spec,
            env,
            state: TaskState::Unvalidated,
            store: None,
            keep_store: false,
            config: None,
            positions: None,
            structures: None,
            locked: Vec::new(),
            errors: ErrorAggregate::new(),
            warnings: Vec::new(),
            log: None,
        }
    }

    /// Keep the store handle (and its locks) open between validation and run
    pub fn keep_store(mut self, keep: bool) -> Self {
        self.keep_store = keep;
        self
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn errors(&self) -> &ErrorAggregate {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Positions after validation resolved the filter
    pub fn resolved_positions(&self) -> Option<&[usize]> {
        self.positions.as_deref()
    }

    pub fn resolved_structures(&self) -> Option<&[usize]> {
        self.structures.as_deref()
    }

    pub fn describe(&self) -> String {
        self.spec.describe()
    }

    pub fn set_log(&mut self, log: Option<TaskLog>) {
        self.log = log;
    }

    pub fn log(&self) -> Option<&TaskLog> {
        self.log.as_ref()
    }

    /// Subtask increments one run will report
    pub fn count_subtasks(&self) -> usize {
        let positions = self
            .positions
            .as_ref()
            .or(self.spec.positions.as_ref())
            .map(Vec::len)
            .unwrap_or(0);
        let structures: Vec<usize> = self
            .structures
            .clone()
            .or_else(|| self.spec.structures.clone())
            .unwrap_or_default();

        let mut per_position = 0;
        if self.spec.pre_process {
            per_position += 1;
        }
        if self.spec.has_track_action() {
            per_position += structures.len();
        }
        if self.spec.generate_track_images {
            per_position += self.structures_with_children(&structures);
        }
        if self.spec.measurements {
            per_position += 1;
        }

        let mut total = positions * per_position;
        total += self.spec.extract_measurement_dirs.len();
        if self.spec.export.is_requested() {
            total += 1;
        }
        if self.spec.extract_dataset.is_some() {
            total += 1;
        }
        if self.spec.extract_raw_dataset.is_some() {
            total += 1;
        }
        total
    }

    fn structures_with_children(&self, structures: &[usize]) -> usize {
        let config = self
            .store
            .as_ref()
            .map(|store| store.config())
            .or(self.config.as_ref());
        match config {
            Some(config) => structures
                .iter()
                .filter(|s| config.has_direct_children(**s))
                .count(),
            None => structures.len(),
        }
    }

    /// Drop the store handle, release every lock and clear errors
    pub fn release(&mut self) {
        self.close_store();
        self.errors.clear();
        self.warnings.clear();
    }

    /// Open the store if not already open
    fn open_store(&mut self, read_only: bool) -> bool {
        if self.store.is_none() {
            debug!(store = %self.spec.store, read_only, "Opening store");
            self.store = self
                .env
                .provider
                .open(&self.spec.store, &self.spec.dir, read_only);
        }
        self.store.is_some()
    }

    fn close_store(&mut self) {
        if let Some(store) = self.store.take() {
            if !self.locked.is_empty() {
                store.unlock_positions(&self.locked);
                self.locked.clear();
            }
            store.unlock_configuration();
        }
    }

    /// Record a message on the UI and in the task log
    fn report(&mut self, sink: &ProgressSink, text: &str) {
        sink.message(text);
        if let Some(log) = &mut self.log {
            log.line("INFO", text);
        }
    }

    /// Forward validation warnings to the UI and the task log
    fn publish_warnings(&mut self, sink: &ProgressSink) {
        for text in &self.warnings {
            sink.warning(text);
            if let Some(log) = &mut self.log {
                log.line("WARN", text);
            }
        }
    }

    fn record_stage_error(&mut self, context: String, stage: &str, error: StageError) {
        record_stage_error(&mut self.errors, context, stage, error);
    }

    /// Flatten the aggregate and publish it (UI, tracing and task log)
    pub fn publish_errors(&mut self, sink: &ProgressSink) {
        if let Some(log) = &mut self.log {
            log.errors(&self.errors);
        }
        sink.publish_errors(&self.errors);
    }
}

/// Fold a stage failure into an aggregate; collaborator aggregates are nested, not re-wrapped
pub(crate) fn record_stage_error(
    errors: &mut ErrorAggregate,
    context: String,
    stage: &str,
    error: StageError,
) {
    match error {
        StageError::Failed { message, trace } => {
            errors.add_with_trace(context, TaskError::stage(stage, message), trace)
        }
        StageError::Aggregate(nested) => errors.add_nested(context, nested),
        StageError::Io(e) => errors.add(context, TaskError::stage(stage, e.to_string())),
    }
}

/// Positions kept by a selection; an empty position list keeps everything
pub(crate) fn filter_by_selection(
    config: &ExperimentConfig,
    positions: &[usize],
    selection_positions: Option<&[String]>,
) -> Vec<usize> {
    match selection_positions {
        Some(names) if !names.is_empty() => positions
            .iter()
            .copied()
            .filter(|p| {
                config
                    .position_name(*p)
                    .map(|n| names.iter().any(|s| s == n))
                    .unwrap_or(false)
            })
            .collect(),
        _ => positions.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{environment, experiment, MemoryProvider, RecordingStages};

    #[test]
    fn test_count_subtasks_example() {
        let provider = MemoryProvider::new(experiment(1, 2));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_positions([0])
                .with_structures([1])
                .with_actions(false, true, false, true),
            environment(&provider, &stages),
        );
        assert!(task.is_valid());
        assert_eq!(task.count_subtasks(), 2);
    }

    #[test]
    fn test_count_subtasks_with_exports() {
        let provider = MemoryProvider::new(experiment(3, 3));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/tmp")
                .with_actions(true, false, true, false)
                .with_track_images(true)
                .add_extract_measurement_dir(std::env::temp_dir(), [])
                .with_export(ExportOptions {
                    objects: true,
                    ..Default::default()
                }),
            environment(&provider, &stages),
        )
        .keep_store(true);
        assert!(task.is_valid());
        // 3 positions x (1 pre + 3 track + 1 structure with children) + extract + export
        assert_eq!(task.count_subtasks(), 3 * 5 + 2);
    }

    #[test]
    fn test_count_matches_reported_progress_after_handle_closed() {
        let provider = MemoryProvider::new(experiment(1, 3));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_actions(false, false, true, false)
                .with_track_images(true),
            environment(&provider, &stages),
        );
        assert!(task.is_valid());
        // 3 tracked structures, only s0 has children
        assert_eq!(task.count_subtasks(), 4);

        let sink = ProgressSink::silent();
        task.run_task(&sink);
        assert!(task.errors().is_empty());
        assert_eq!(sink.subtask_index(), task.count_subtasks());
    }

    #[test]
    fn test_filter_by_selection() {
        let config = experiment(4, 1);
        let names = vec!["pos1".to_string(), "pos3".to_string()];
        assert_eq!(
            filter_by_selection(&config, &[0, 1, 2, 3], Some(&names)),
            vec![1, 3]
        );
        assert_eq!(filter_by_selection(&config, &[0, 2], Some(&[])), vec![0, 2]);
        assert_eq!(filter_by_selection(&config, &[0, 2], None), vec![0, 2]);
    }

    #[test]
    fn test_release_clears_errors_and_handle() {
        let provider = MemoryProvider::new(experiment(1, 1));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(TaskSpec::new("exp", "/d"), environment(&provider, &stages))
            .keep_store(true);
        assert!(!task.is_valid());
        assert!(!task.errors().is_empty());

        task.release();
        assert!(task.errors().is_empty());
        assert!(provider.journal().contains(&"unlock configuration".to_string()));
    }
}
