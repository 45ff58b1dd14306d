// Task Validation
// Resolves the scope filters against the store and checks every request without mutating it

use super::error::TaskError;
use super::spec::{DatasetExtraction, RawDatasetExtraction};
use super::{Task, TaskState};
use crate::store::ExperimentConfig;

use std::collections::HashSet;
use tracing::{debug, warn};

impl Task {
    /// Validate the task.
    ///
    /// Every check runs even after an earlier one failed, so the error
    /// aggregate lists all problems at once. Only an unreachable store stops
    /// validation early. Calling this twice on an unchanged store yields the
    /// same errors.
    pub fn is_valid(&mut self) -> bool {
        self.errors.clear();
        self.warnings.clear();

        if !self.open_store(true) {
            self.errors.add(
                "store",
                TaskError::Configuration(format!(
                    "could not open store '{}' in {}",
                    self.spec.store,
                    self.spec.dir.display()
                )),
            );
            self.state = TaskState::Invalid;
            return false;
        }

        let (config, selection) = match &self.store {
            Some(store) => (
                store.config().clone(),
                self.spec.selection.as_deref().map(|name| (name.to_string(), store.selection(name))),
            ),
            None => return false,
        };

        let positions = self
            .spec
            .positions
            .clone()
            .unwrap_or_else(|| config.all_positions());
        let structures = self
            .spec
            .structures
            .clone()
            .unwrap_or_else(|| config.all_structures());

        if self.spec.segment_and_track && self.spec.track_only {
            self.errors.add(
                "actions",
                TaskError::Validation("segmentAndTrack and trackOnly are mutually exclusive".into()),
            );
        }

        for p in &positions {
            if *p >= config.position_count() {
                self.errors.add(
                    "positions",
                    TaskError::Validation(format!(
                        "position index {} out of range ({} positions)",
                        p,
                        config.position_count()
                    )),
                );
            }
        }
        for s in &structures {
            if *s >= config.structure_count() {
                self.errors.add(
                    "structures",
                    TaskError::Validation(format!(
                        "structure index {} out of range ({} structures)",
                        s,
                        config.structure_count()
                    )),
                );
            }
        }

        if self.spec.pre_process {
            for p in positions.iter().filter(|p| **p < config.position_count()) {
                if !config.pre_processing_matches_template(*p) {
                    let name = config.position_name(*p).unwrap_or_default();
                    let text = format!(
                        "position {} has a pre-processing pipeline differing from the template",
                        name
                    );
                    warn!(task = %self.spec.store, "{}", text);
                    self.warnings.push(text);
                }
            }
        }

        if let Some((name, found)) = selection {
            match found {
                None => self.errors.add(
                    "selection",
                    TaskError::Validation(format!("selection '{}' not found", name)),
                ),
                Some(selection) => {
                    if self.spec.pre_process {
                        self.errors.add(
                            "selection",
                            TaskError::Validation(
                                "a selection cannot be combined with pre-processing".into(),
                            ),
                        );
                    }
                    if self.spec.export.track_images {
                        self.errors.add(
                            "selection",
                            TaskError::Validation(
                                "a selection cannot be combined with track image export".into(),
                            ),
                        );
                    }
                    if self.spec.export.pre_processed_images {
                        self.errors.add(
                            "selection",
                            TaskError::Validation(
                                "a selection cannot be combined with image export".into(),
                            ),
                        );
                    }
                    if let Some(class) = selection.object_class {
                        let valid: Vec<usize> = structures
                            .iter()
                            .copied()
                            .filter(|s| *s < config.structure_count())
                            .collect();
                        let common = config.first_common_parent(&valid);
                        let compatible = match common {
                            Some(parent) => config.is_ancestor_or_self(class, parent),
                            None => valid.is_empty(),
                        };
                        if !compatible {
                            self.errors.add(
                                "selection",
                                TaskError::Validation(format!(
                                    "selection '{}' holds object class {} which is not a parent of the requested structures",
                                    selection.name, class
                                )),
                            );
                        }
                    }
                }
            }
        }

        for extraction in &self.spec.extract_measurement_dirs {
            let context = format!("extract {}", extraction.dir.display());
            if !extraction.dir.is_dir() {
                self.errors.add(
                    context.clone(),
                    TaskError::Validation("extraction directory does not exist".into()),
                );
            }
            for s in &extraction.structures {
                if *s >= config.structure_count() {
                    self.errors.add(
                        context.clone(),
                        TaskError::Validation(format!("invalid structure index {}", s)),
                    );
                }
            }
        }

        if !self.spec.has_any_action() {
            self.errors.add(
                "actions",
                TaskError::Configuration("no action or extraction requested".into()),
            );
        }

        let mut problems = Vec::new();
        if let Some(dataset) = &self.spec.extract_dataset {
            let store = self.store.as_deref();
            problems.extend(check_dataset(dataset, &config, |name| {
                store.and_then(|s| s.selection(name)).is_some()
            }));
        }
        if let Some(raw) = &self.spec.extract_raw_dataset {
            problems.extend(check_raw_dataset(raw, &config));
        }
        for (context, message) in problems {
            self.errors.add(context, TaskError::Validation(message));
        }

        self.positions = Some(positions);
        self.structures = Some(structures);
        self.config = Some(config);
        self.state = if self.errors.is_empty() {
            TaskState::Validated
        } else {
            TaskState::Invalid
        };
        debug!(
            task = %self.spec.store,
            errors = self.errors.len(),
            warnings = self.warnings.len(),
            "Validated {}",
            self.spec.describe()
        );

        if !self.keep_store {
            self.close_store();
        }
        self.errors.is_empty()
    }
}

fn check_dataset(
    dataset: &DatasetExtraction,
    config: &ExperimentConfig,
    selection_exists: impl Fn(&str) -> bool,
) -> Vec<(String, String)> {
    let context = "extractDataset".to_string();
    let mut problems = Vec::new();

    if dataset.features.is_empty() {
        problems.push((context.clone(), "no features requested".to_string()));
    }
    let mut names = HashSet::new();
    for feature in &dataset.features {
        if !names.insert(feature.name.as_str()) {
            problems.push((context.clone(), format!("duplicate feature name '{}'", feature.name)));
        }
        if feature.object_class >= config.structure_count() {
            problems.push((
                context.clone(),
                format!(
                    "feature '{}' uses invalid object class {}",
                    feature.name, feature.object_class
                ),
            ));
        }
    }
    for name in &dataset.selections {
        if !selection_exists(name) {
            problems.push((context.clone(), format!("selection '{}' not found", name)));
        }
    }
    if dataset.dimensions.iter().any(|d| *d == 0) {
        problems.push((context.clone(), "output dimensions must be positive".to_string()));
    }
    if let Some(erase) = &dataset.erase_touching_contours {
        for class in erase {
            if *class >= config.structure_count() {
                problems.push((
                    context.clone(),
                    format!("invalid object class {} in touching contour erasure", class),
                ));
            }
        }
    }
    problems
}

fn check_raw_dataset(raw: &RawDatasetExtraction, config: &ExperimentConfig) -> Vec<(String, String)> {
    let context = "extractRawDataset".to_string();
    let mut problems = Vec::new();

    for channel in &raw.channels {
        if *channel >= config.channel_count() {
            problems.push((context.clone(), format!("invalid channel index {}", channel)));
        }
    }
    if let Some(bounds) = &raw.bounds {
        let values = [
            bounds.x_min,
            bounds.x_max,
            bounds.y_min,
            bounds.y_max,
            bounds.z_min,
            bounds.z_max,
        ];
        if values.iter().any(|v| *v < 0) {
            problems.push((context.clone(), "bounds must be non-negative".to_string()));
        }
    }
    for (position, frames) in &raw.frames {
        if config.position_index(position).is_none() {
            problems.push((context.clone(), format!("unknown position '{}'", position)));
        }
        if frames.iter().any(|f| *f < 0) {
            problems.push((
                context.clone(),
                format!("negative frame index for position '{}'", position),
            ));
        }
    }
    problems
}
