// Task Execution
// Locks positions, drives the stage collaborators position by position and accumulates failures

use super::error::TaskError;
use super::{filter_by_selection, Task, TaskState};
use crate::report::ProgressSink;
use crate::stages::{StageContext, StageError, StageRunner};
use crate::store::{ExperimentConfig, ExperimentStore, Selection};

use std::time::Instant;
use tracing::{debug, info};

/// Per-position cleanup; runs when the position is done, failed or unwound
pub(crate) struct PositionCleanup<'a> {
    stages: &'a dyn StageRunner,
    ctx: StageContext<'a>,
}

impl<'a> PositionCleanup<'a> {
    pub(crate) fn new(stages: &'a dyn StageRunner, ctx: StageContext<'a>) -> Self {
        Self { stages, ctx }
    }
}

impl Drop for PositionCleanup<'_> {
    fn drop(&mut self) {
        self.stages.release_position(&self.ctx);
        self.ctx.store.clear_cache(Some(self.ctx.position_name));
        debug!(position = %self.ctx.position_name, "Released position resources");
    }
}

/// Resolved scope of one run
struct RunScope {
    structures: Vec<usize>,
    selection: Option<Selection>,
    delete_all: bool,
    /// Every object of the store was already deleted before the first position
    store_cleared: bool,
}

impl Task {
    /// Execute the task.
    ///
    /// Failures never escape: a position that cannot be locked is skipped, a
    /// failing stage is recorded with its position/structure context and the
    /// remaining structures and positions still run.
    pub fn run_task(&mut self, sink: &ProgressSink) {
        let started = Instant::now();
        self.state = TaskState::Running;
        self.publish_warnings(sink);

        if self.open_store(false) {
            sink.set_subtask_total(self.count_subtasks());
        }
        let Some(store) = self.store.take() else {
            self.errors.add(
                "store",
                TaskError::Configuration(format!(
                    "could not open store '{}' in {}",
                    self.spec.store,
                    self.spec.dir.display()
                )),
            );
            self.state = TaskState::Done;
            return;
        };
        let config = store.config().clone();

        let selection = match self.spec.selection.clone() {
            Some(name) => match store.selection(&name) {
                Some(selection) => Some(selection),
                None => {
                    self.errors.add(
                        "selection",
                        TaskError::Configuration(format!("selection '{}' not found", name)),
                    );
                    self.store = Some(store);
                    self.finish(sink, started);
                    return;
                }
            },
            None => None,
        };

        let mut structures: Vec<usize> = self
            .structures
            .clone()
            .or_else(|| self.spec.structures.clone())
            .unwrap_or_else(|| config.all_structures())
            .into_iter()
            .filter(|s| *s < config.structure_count())
            .collect();
        structures.sort_unstable();
        structures.dedup();

        let requested: Vec<usize> = self
            .positions
            .clone()
            .or_else(|| self.spec.positions.clone())
            .unwrap_or_else(|| config.all_positions())
            .into_iter()
            .filter(|p| *p < config.position_count())
            .collect();
        let requested = filter_by_selection(
            &config,
            &requested,
            selection.as_ref().map(|s| s.positions.as_slice()),
        );

        // Lock one position at a time so a single busy position only skips itself
        let mut positions = Vec::new();
        for p in requested {
            let name = config.position_name(p).unwrap_or_default().to_string();
            if self.locked.contains(&name) || store.lock_positions(std::slice::from_ref(&name)) {
                if !self.locked.contains(&name) {
                    self.locked.push(name);
                }
                positions.push(p);
            } else {
                self.errors.add(
                    format!("position {}", name),
                    TaskError::ResourceLock { position: name.clone() },
                );
                self.report(sink, &format!("Position {} is locked elsewhere, skipping", name));
            }
        }

        let mut scope = RunScope {
            delete_all: self.spec.segment_and_track
                && selection.is_none()
                && structures == config.all_structures(),
            store_cleared: false,
            structures,
            selection,
        };
        if scope.delete_all && positions == config.all_positions() {
            debug!(store = %self.spec.store, "Deleting all objects");
            match store.delete_all_objects() {
                Ok(()) => scope.store_cleared = true,
                Err(e) => {
                    self.record_stage_error("store".to_string(), "deleteObjects", StageError::Io(e))
                }
            }
        }

        let stages = self.env.stages.clone();
        for p in &positions {
            let name = config.position_name(*p).unwrap_or_default();
            let ctx = StageContext {
                store: store.as_ref(),
                config: &config,
                position: *p,
                position_name: name,
                scratch_dir: None,
            };
            let _cleanup = PositionCleanup::new(stages.as_ref(), ctx);
            self.process_position(stages.as_ref(), &ctx, &scope, sink);
        }

        let names: Vec<String> = positions
            .iter()
            .filter_map(|p| config.position_name(*p))
            .map(str::to_string)
            .collect();
        self.run_extractions(stages.as_ref(), store.as_ref(), &config, &names, sink);

        self.store = Some(store);
        self.finish(sink, started);
    }

    fn process_position(
        &mut self,
        stages: &dyn StageRunner,
        ctx: &StageContext<'_>,
        scope: &RunScope,
        sink: &ProgressSink,
    ) {
        let position = ctx.position_name;
        let selection = scope.selection.as_ref();

        if scope.delete_all && !scope.store_cleared {
            if let Err(e) = stages.delete_objects(ctx, &ctx.config.all_structures()) {
                self.record_stage_error(format!("position {}", position), "deleteObjects", e);
            }
        }

        if self.spec.pre_process {
            self.report(sink, &format!("Pre-processing position {}", position));
            if let Some(bytes) = stages.memory_usage() {
                debug!(position, bytes, "Memory before pre-processing");
            }
            if let Err(e) = stages.pre_process_images(ctx) {
                self.record_stage_error(format!("position {}", position), "preProcess", e);
            }
            if let Some(bytes) = stages.memory_usage() {
                debug!(position, bytes, "Memory after pre-processing");
            }
            if self.spec.has_track_action() {
                if let Err(e) = stages.get_or_create_root_track(ctx) {
                    self.record_stage_error(format!("position {}", position), "rootTrack", e);
                }
            }
            sink.increment_subtask();
        }

        if self.spec.has_track_action() {
            let stage = if self.spec.track_only {
                "trackOnly"
            } else {
                "segmentAndTrack"
            };
            for s in &scope.structures {
                let context = format!("position {} / structure {}", position, s);
                self.report(sink, &format!("{} position {} structure {}", stage, position, s));
                if self.spec.segment_and_track && !scope.delete_all && selection.is_none() {
                    if let Err(e) = stages.delete_objects(ctx, &[*s]) {
                        self.record_stage_error(context.clone(), "deleteObjects", e);
                    }
                }
                if let Err(e) =
                    stages.execute_processing_scheme(ctx, *s, self.spec.track_only, selection)
                {
                    self.record_stage_error(context, stage, e);
                }
                sink.increment_subtask();
            }
        }

        if self.spec.generate_track_images {
            for s in scope
                .structures
                .iter()
                .filter(|s| ctx.config.has_direct_children(**s))
            {
                if let Err(e) = stages.generate_track_images(ctx, *s) {
                    self.record_stage_error(
                        format!("position {} / structure {}", position, s),
                        "trackImages",
                        e,
                    );
                }
                sink.increment_subtask();
            }
        }

        if self.spec.measurements {
            self.report(sink, &format!("Measurements for position {}", position));
            if let Err(e) = stages.perform_measurements(ctx, self.spec.measurement_mode, selection) {
                self.record_stage_error(format!("position {}", position), "measurements", e);
            }
            sink.increment_subtask();
        }
    }

    fn run_extractions(
        &mut self,
        stages: &dyn StageRunner,
        store: &dyn ExperimentStore,
        config: &ExperimentConfig,
        positions: &[String],
        sink: &ProgressSink,
    ) {
        let extractions = self.spec.extract_measurement_dirs.clone();
        for extraction in &extractions {
            let structures = if extraction.structures.is_empty() {
                config.all_structures()
            } else {
                extraction.structures.clone()
            };
            self.report(
                sink,
                &format!("Extracting measurements to {}", extraction.dir.display()),
            );
            if let Err(e) =
                stages.extract_measurements(store, config, &extraction.dir, positions, &structures)
            {
                self.record_stage_error(
                    format!("extract {}", extraction.dir.display()),
                    "extractMeasurements",
                    e,
                );
            }
            sink.increment_subtask();
        }

        if self.spec.export.is_requested() {
            self.report(sink, "Exporting archive");
            let export = self.spec.export.clone();
            if let Err(e) = stages.export_archive(store, &export, positions) {
                self.record_stage_error("export".to_string(), "export", e);
            }
            sink.increment_subtask();
        }

        let extractor = self.env.dataset_extractor.clone();
        if let Some(dataset) = self.spec.extract_dataset.clone() {
            match &extractor {
                Some(extractor) => {
                    self.report(sink, &format!("Extracting dataset {}", dataset.output_file.display()));
                    if let Err(e) = extractor.run_task(store, &dataset, positions) {
                        self.record_stage_error("extractDataset".to_string(), "extractDataset", e);
                    }
                }
                None => self.errors.add(
                    "extractDataset",
                    TaskError::ExtractionModuleMissing {
                        operation: "extractDataset".into(),
                    },
                ),
            }
            sink.increment_subtask();
        }
        if let Some(raw) = self.spec.extract_raw_dataset.clone() {
            match &extractor {
                Some(extractor) => {
                    self.report(sink, &format!("Extracting raw dataset {}", raw.output_file.display()));
                    if let Err(e) = extractor.run_task_raw(store, &raw) {
                        self.record_stage_error(
                            "extractRawDataset".to_string(),
                            "extractRawDataset",
                            e,
                        );
                    }
                }
                None => self.errors.add(
                    "extractRawDataset",
                    TaskError::ExtractionModuleMissing {
                        operation: "extractRawDataset".into(),
                    },
                ),
            }
            sink.increment_subtask();
        }
    }

    /// Release locks (or only caches when the handle is kept) and mark the task done
    fn finish(&mut self, sink: &ProgressSink, started: Instant) {
        if self.keep_store {
            if let Some(store) = &self.store {
                store.clear_cache(None);
            }
        } else {
            self.close_store();
        }
        self.state = TaskState::Done;

        let summary = format!(
            "Task {} finished in {:.1}s with {} error(s)",
            self.spec.store,
            started.elapsed().as_secs_f64(),
            self.errors.flatten().len()
        );
        info!(task = %self.spec.store, errors = self.errors.len(), "{}", summary);
        if let Some(log) = &mut self.log {
            log.line("INFO", &summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{environment, experiment, MemoryProvider, RecordingStages};
    use crate::stages::DatasetExtractor;
    use crate::task::spec::{DatasetExtraction, ExportOptions, FeatureSpec, RawDatasetExtraction, TaskSpec};
    use crate::task::TaskEnvironment;
    use std::sync::{Arc, Mutex};

    fn position_calls(calls: &[String], position: &str) -> Vec<String> {
        calls
            .iter()
            .filter(|c| c.split(' ').nth(1) == Some(position))
            .cloned()
            .collect()
    }

    #[test]
    fn test_single_structure_track_and_measure() {
        let provider = MemoryProvider::new(experiment(1, 2));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_positions([0])
                .with_structures([1])
                .with_actions(false, true, false, true),
            environment(&provider, &stages),
        );
        let sink = ProgressSink::silent();

        assert!(task.is_valid());
        task.run_task(&sink);

        let calls = stages.calls();
        let segment = calls.iter().position(|c| c.starts_with("segment pos0 s1")).unwrap();
        let measure = calls.iter().position(|c| c == "measure pos0 eraseAll").unwrap();
        assert!(segment < measure);
        assert!(!calls.iter().any(|c| c.contains(" s0 ")));
        let delete = calls.iter().position(|c| c == "delete pos0 [1]").unwrap();
        assert!(delete < segment);
        assert_eq!(calls.iter().filter(|c| c.starts_with("delete")).count(), 1);
        assert!(!provider.journal().contains(&"delete all objects".to_string()));
        assert_eq!(sink.subtask_index(), 2);
        assert!(task.errors().is_empty());
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn test_unopenable_store_finishes_task() {
        let provider = MemoryProvider::new(experiment(1, 1)).unavailable();
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d").with_actions(false, false, false, true),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        assert_eq!(task.state(), TaskState::Done);
        assert!(stages.calls().is_empty());
        let flat = task.errors().flatten();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].context, "store");
        assert!(flat[0].message.contains("could not open store 'exp'"));
    }

    #[test]
    fn test_locked_position_is_skipped() {
        let provider = MemoryProvider::new(experiment(2, 1)).failing_lock("pos1");
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_positions([0, 1])
                .with_actions(true, true, false, true),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        let calls = stages.calls();
        assert!(position_calls(&calls, "pos1").is_empty());
        assert_eq!(
            position_calls(&calls, "pos0"),
            vec![
                "delete pos0 [0]",
                "preProcess pos0",
                "rootTrack pos0",
                "segment pos0 s0 {\"chain\":0}",
                "measure pos0 eraseAll",
                "release pos0",
            ]
        );
        assert_eq!(task.errors().len(), 1);
        assert!(task.errors().mentions("pos1"));
        assert!(matches!(
            &task.errors().entries()[0].cause,
            crate::report::ErrorCause::Error(TaskError::ResourceLock { position }) if position == "pos1"
        ));

        let journal = provider.journal();
        assert!(journal.contains(&"lock pos0".to_string()));
        assert!(journal.contains(&"unlock pos0".to_string()));
        assert!(!journal.contains(&"lock pos1".to_string()));
        assert!(!journal.contains(&"clear cache pos1".to_string()));
    }

    #[test]
    fn test_stage_failure_still_cleans_up() {
        let provider = MemoryProvider::new(experiment(2, 2));
        let stages = Arc::new(RecordingStages::new().fail_structure(0, 1));
        let mut task = Task::new(
            TaskSpec::new("exp", "/d").with_actions(false, true, false, false),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        let calls = stages.calls();
        let release0 = calls.iter().position(|c| c == "release pos0").unwrap();
        let first_pos1 = calls.iter().position(|c| c.contains(" pos1")).unwrap();
        assert!(release0 < first_pos1);
        assert_eq!(
            position_calls(&calls, "pos1"),
            vec![
                "segment pos1 s0 {\"chain\":0}",
                "segment pos1 s1 {\"chain\":1}",
                "release pos1",
            ]
        );

        let flat = task.errors().flatten();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].context, "position pos0 / structure 1");
        assert!(flat[0].message.contains("segmentation diverged"));
        assert!(provider.journal().contains(&"clear cache pos0".to_string()));
        // Full reprocessing of every position clears the store once, not per position
        assert!(provider.journal().contains(&"delete all objects".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("delete")));
    }

    #[test]
    fn test_collaborator_aggregate_is_merged() {
        let provider = MemoryProvider::new(experiment(1, 1));
        let stages = Arc::new(RecordingStages::new().fail_with_aggregate(0, 0));
        let mut task = Task::new(
            TaskSpec::new("exp", "/d").with_actions(false, false, true, false),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        assert_eq!(task.errors().len(), 1);
        let flat = task.errors().flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].context, "position pos0 / structure 0 > frame 0");
        assert_eq!(flat[1].context, "position pos0 / structure 0 > frame 1");
    }

    #[test]
    fn test_selection_restricts_positions_and_deletion() {
        let provider = MemoryProvider::new(experiment(3, 2)).with_selection(Selection {
            name: "mitotic".into(),
            object_class: Some(0),
            positions: vec!["pos1".into()],
        });
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_selection("mitotic")
                .with_actions(false, true, false, false),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        assert_eq!(
            stages.calls(),
            vec![
                "segment pos1 s0 {\"chain\":0} sel=mitotic",
                "segment pos1 s1 {\"chain\":1} sel=mitotic",
                "release pos1",
            ]
        );
        assert!(task.errors().is_empty());
    }

    #[test]
    fn test_track_images_and_extractions() {
        let temp = tempfile::tempdir().unwrap();
        let provider = MemoryProvider::new(experiment(1, 2));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_actions(false, false, false, false)
                .with_track_images(true)
                .add_extract_measurement_dir(temp.path(), [])
                .with_export(ExportOptions {
                    objects: true,
                    ..Default::default()
                }),
            environment(&provider, &stages),
        );
        let sink = ProgressSink::silent();

        task.run_task(&sink);

        let calls = stages.calls();
        assert_eq!(calls[0], "trackImages pos0 s0");
        assert_eq!(calls[1], "release pos0");
        assert_eq!(
            calls[2],
            format!("extract {} [\"pos0\"] [0, 1]", temp.path().display())
        );
        assert_eq!(calls[3], "export [\"pos0\"]");
        assert_eq!(sink.subtask_index(), 3);
    }

    fn dataset() -> DatasetExtraction {
        DatasetExtraction {
            output_file: "/out/set.h5".into(),
            selections: vec![],
            features: vec![FeatureSpec {
                name: "area".into(),
                extractor: "Size".into(),
                object_class: 0,
            }],
            dimensions: [32, 32],
            erase_touching_contours: None,
        }
    }

    #[test]
    fn test_missing_extractor_is_recoverable() {
        let provider = MemoryProvider::new(experiment(1, 1));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_actions(false, false, false, true)
                .with_dataset(dataset()),
            environment(&provider, &stages),
        );

        task.run_task(&ProgressSink::silent());

        assert!(stages.calls().contains(&"measure pos0 eraseAll".to_string()));
        assert_eq!(task.errors().len(), 1);
        assert!(matches!(
            &task.errors().entries()[0].cause,
            crate::report::ErrorCause::Error(TaskError::ExtractionModuleMissing { .. })
        ));
        assert_eq!(task.state(), TaskState::Done);
    }

    #[derive(Default)]
    struct RecordingExtractor {
        calls: Mutex<Vec<String>>,
    }

    impl DatasetExtractor for RecordingExtractor {
        fn run_task(
            &self,
            _store: &dyn ExperimentStore,
            spec: &DatasetExtraction,
            positions: &[String],
        ) -> Result<(), StageError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("dataset {} {:?}", spec.output_file.display(), positions));
            Ok(())
        }

        fn run_task_raw(
            &self,
            _store: &dyn ExperimentStore,
            _spec: &RawDatasetExtraction,
        ) -> Result<(), StageError> {
            Err(StageError::failed("raw extraction unsupported"))
        }
    }

    #[test]
    fn test_injected_extractor_is_used() {
        let provider = MemoryProvider::new(experiment(2, 1));
        let stages = Arc::new(RecordingStages::new());
        let extractor = Arc::new(RecordingExtractor::default());
        let env: TaskEnvironment =
            environment(&provider, &stages).with_dataset_extractor(extractor.clone());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d")
                .with_dataset(dataset())
                .with_raw_dataset(RawDatasetExtraction {
                    output_file: "/out/raw.h5".into(),
                    channels: vec![0],
                    bounds: None,
                    frames: Default::default(),
                }),
            env,
        );

        task.run_task(&ProgressSink::silent());

        assert_eq!(
            extractor.calls.lock().unwrap().clone(),
            vec!["dataset /out/set.h5 [\"pos0\", \"pos1\"]"]
        );
        assert!(task.errors().mentions("raw extraction unsupported"));
    }

    #[test]
    fn test_kept_store_only_clears_caches() {
        let provider = MemoryProvider::new(experiment(1, 1));
        let stages = Arc::new(RecordingStages::new());
        let mut task = Task::new(
            TaskSpec::new("exp", "/d").with_actions(false, false, false, true),
            environment(&provider, &stages),
        )
        .keep_store(true);

        assert!(task.is_valid());
        task.run_task(&ProgressSink::silent());

        let journal = provider.journal();
        assert!(journal.contains(&"clear cache *".to_string()));
        assert!(!journal.contains(&"unlock pos0".to_string()));

        task.release();
        assert!(provider.journal().contains(&"unlock pos0".to_string()));
        assert_eq!(provider.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
