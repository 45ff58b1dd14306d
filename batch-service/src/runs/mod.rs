// Optimization Runs
// Named alternate per-object-class processing chains, executed through the regular stage pipeline

use crate::error::{ServiceError, ServiceResult};
use crate::report::{ErrorAggregate, ProgressSink};
use crate::store::ExperimentConfig;
use crate::task::error::TaskError;
use crate::task::execute::PositionCleanup;
use crate::task::log::TaskLog;
use crate::task::spec::MeasurementMode;
use crate::task::{record_stage_error, Schedulable, TaskEnvironment};
use crate::stages::StageContext;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const CONFIG_PREFIX: &str = "objectClass";
const CONFIG_SUFFIX: &str = ".json";

/// Directory holding the runs of a store
pub fn runs_root(dir: &Path, store: &str) -> PathBuf {
    dir.join(store).join("Optimization").join("Runs")
}

fn config_file_name(object_class: usize) -> String {
    format!("{}{}{}", CONFIG_PREFIX, object_class, CONFIG_SUFFIX)
}

fn parse_config_file_name(name: &str) -> Option<usize> {
    name.strip_prefix(CONFIG_PREFIX)?
        .strip_suffix(CONFIG_SUFFIX)?
        .parse()
        .ok()
}

/// A registered run: a directory with at least one processing-chain config
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    name: String,
    dir: PathBuf,
    configs: BTreeMap<usize, Value>,
}

impl Run {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run directory; CSV extracts are written here
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn configs(&self) -> &BTreeMap<usize, Value> {
        &self.configs
    }

    pub fn object_classes(&self) -> Vec<usize> {
        self.configs.keys().copied().collect()
    }

    /// Copy of `config` with this run's processing chains substituted in
    pub fn apply(&self, config: &ExperimentConfig) -> ExperimentConfig {
        let mut alternate = config.clone();
        for (object_class, chain) in &self.configs {
            if let Some(structure) = alternate.structures.get_mut(*object_class) {
                structure.processing_chain = chain.clone();
            }
        }
        alternate
    }

    /// Configured object classes plus all their ancestors, ascending
    pub fn processed_structures(&self, config: &ExperimentConfig) -> Vec<usize> {
        let mut structures: Vec<usize> = self
            .configs
            .keys()
            .flat_map(|s| config.path_to_root(*s))
            .collect();
        structures.sort_unstable();
        structures.dedup();
        structures
    }

    fn load(dir: &Path) -> ServiceResult<Option<Run>> {
        let name = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };

        let mut configs = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(object_class) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_config_file_name)
            else {
                continue;
            };
            match fs::read_to_string(&path)
                .map_err(ServiceError::from)
                .and_then(|c| serde_json::from_str::<Value>(&c).map_err(ServiceError::from))
            {
                Ok(chain) => {
                    configs.insert(object_class, chain);
                }
                Err(e) => warn!(run = %name, file = %path.display(), "Ignoring unreadable run config: {}", e),
            }
        }

        if configs.is_empty() {
            debug!(run = %name, "Skipping run without configurations");
            return Ok(None);
        }
        Ok(Some(Run {
            name,
            dir: dir.to_path_buf(),
            configs,
        }))
    }
}

/// Runs registered under one root directory, in name order
#[derive(Debug, Clone)]
pub struct AlternateRunRegistry {
    root: PathBuf,
    runs: Vec<Run>,
}

impl AlternateRunRegistry {
    /// Empty registry; call [`AlternateRunRegistry::reload`] to scan the root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: Vec::new(),
        }
    }

    pub fn load(root: impl Into<PathBuf>) -> ServiceResult<Self> {
        let mut registry = Self::new(root);
        registry.reload()?;
        Ok(registry)
    }

    /// Registry of a store's `Optimization/Runs` directory
    pub fn for_store(dir: &Path, store: &str) -> ServiceResult<Self> {
        Self::load(runs_root(dir, store))
    }

    /// Like [`AlternateRunRegistry::for_store`], but `dir` must already hold the store
    pub fn for_existing_store(dir: &Path, store: &str) -> ServiceResult<Self> {
        if !dir.join(store).is_dir() {
            return Err(ServiceError::StoreUnavailable {
                name: store.to_string(),
                dir: dir.display().to_string(),
            });
        }
        Self::for_store(dir, store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn get(&self, name: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.name == name)
    }

    /// Rescan the root; a missing root is an empty registry
    pub fn reload(&mut self) -> ServiceResult<()> {
        self.runs.clear();
        if !self.root.is_dir() {
            return Ok(());
        }

        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            if let Some(run) = Run::load(&dir)? {
                self.runs.push(run);
            }
        }
        debug!(root = %self.root.display(), runs = self.runs.len(), "Loaded optimization runs");
        Ok(())
    }

    /// Create a run directory; the run is registered once a config is saved
    pub fn create_run(&mut self, name: &str) -> ServiceResult<PathBuf> {
        let dir = self.run_dir(name)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write the processing chain of one object class and rescan
    pub fn save_config(&mut self, run: &str, object_class: usize, chain: &Value) -> ServiceResult<()> {
        let dir = self.create_run(run)?;
        let content = serde_json::to_string_pretty(chain)?;
        fs::write(dir.join(config_file_name(object_class)), content)?;
        info!(run, object_class, "Saved run configuration");
        self.reload()
    }

    /// Delete the config of one object class; `false` when there was none
    pub fn remove_config(&mut self, run: &str, object_class: usize) -> ServiceResult<bool> {
        let path = self.run_dir(run)?.join(config_file_name(object_class));
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!(run, object_class, "Removed run configuration");
        self.reload()?;
        Ok(true)
    }

    fn run_dir(&self, name: &str) -> ServiceResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ServiceError::Run(format!("invalid run name '{}'", name)));
        }
        Ok(self.root.join(name))
    }
}

/// Descriptor of an optimization-run unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    #[serde(alias = "dbName")]
    pub store: String,
    pub dir: PathBuf,
    /// Runs to execute; empty means every registered run
    #[serde(default)]
    pub runs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<usize>>,
}

/// Unit executing one or more runs over a position subset
pub struct RunTask {
    spec: RunSpec,
    env: TaskEnvironment,
    runs: Vec<Run>,
    config: Option<ExperimentConfig>,
    errors: ErrorAggregate,
    log: Option<TaskLog>,
}

impl RunTask {
    pub fn new(spec: RunSpec, env: TaskEnvironment) -> Self {
        Self {
            spec,
            env,
            runs: Vec::new(),
            config: None,
            errors: ErrorAggregate::new(),
            log: None,
        }
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// Runs resolved by the last validation
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    fn positions(&self, config: &ExperimentConfig) -> Vec<usize> {
        self.spec
            .positions
            .clone()
            .unwrap_or_else(|| config.all_positions())
    }

    fn report(&mut self, sink: &ProgressSink, text: &str) {
        sink.message(text);
        if let Some(log) = &mut self.log {
            log.line("INFO", text);
        }
    }
}

impl Schedulable for RunTask {
    fn describe(&self) -> String {
        let runs = if self.spec.runs.is_empty() {
            "all".to_string()
        } else {
            self.spec.runs.join(",")
        };
        format!(
            "{} ({}) optimization runs={}",
            self.spec.store,
            self.spec.dir.display(),
            runs
        )
    }

    fn is_valid(&mut self) -> bool {
        self.errors.clear();
        self.runs.clear();
        self.config = None;

        let Some(store) = self.env.provider.open(&self.spec.store, &self.spec.dir, true) else {
            self.errors.add(
                "store",
                TaskError::Configuration(format!(
                    "could not open store '{}' in {}",
                    self.spec.store,
                    self.spec.dir.display()
                )),
            );
            return false;
        };
        let config = store.config().clone();
        store.unlock_configuration();
        drop(store);

        match AlternateRunRegistry::for_store(&self.spec.dir, &self.spec.store) {
            Ok(registry) => {
                if self.spec.runs.is_empty() {
                    self.runs = registry.runs().to_vec();
                } else {
                    for name in &self.spec.runs {
                        match registry.get(name) {
                            Some(run) => self.runs.push(run.clone()),
                            None => self.errors.add(
                                format!("run {}", name),
                                TaskError::Validation(format!("run '{}' not found", name)),
                            ),
                        }
                    }
                }
            }
            Err(e) => self
                .errors
                .add("runs", TaskError::Configuration(e.to_string())),
        }

        if self.runs.is_empty() && self.errors.is_empty() {
            self.errors.add(
                "runs",
                TaskError::Configuration("no optimization run to execute".into()),
            );
        }
        for run in &self.runs {
            for object_class in run.configs.keys() {
                if *object_class >= config.structure_count() {
                    self.errors.add(
                        format!("run {}", run.name),
                        TaskError::Validation(format!("invalid object class {}", object_class)),
                    );
                }
            }
        }
        for p in self.positions(&config) {
            if p >= config.position_count() {
                self.errors.add(
                    "positions",
                    TaskError::Validation(format!("position index {} out of range", p)),
                );
            }
        }

        self.config = Some(config);
        self.errors.is_empty()
    }

    fn count_subtasks(&self) -> usize {
        let Some(config) = &self.config else {
            return 0;
        };
        let positions = self.positions(config).len();
        self.runs
            .iter()
            .map(|run| positions * (run.processed_structures(config).len() + 1) + 1)
            .sum()
    }

    fn run_task(&mut self, sink: &ProgressSink) {
        let started = Instant::now();
        let valid = if self.config.is_some() {
            self.errors.is_empty()
        } else {
            self.is_valid()
        };
        if !valid {
            return;
        }

        let Some(store) = self.env.provider.open(&self.spec.store, &self.spec.dir, false) else {
            self.errors.add(
                "store",
                TaskError::Configuration(format!("could not open store '{}'", self.spec.store)),
            );
            return;
        };
        sink.set_subtask_total(self.count_subtasks());
        let base = store.config().clone();

        let mut locked = Vec::new();
        for p in self.positions(&base) {
            let Some(name) = base.position_name(p) else {
                continue;
            };
            let name = name.to_string();
            if store.lock_positions(std::slice::from_ref(&name)) {
                locked.push((p, name));
            } else {
                self.errors.add(
                    format!("position {}", name),
                    TaskError::ResourceLock { position: name },
                );
            }
        }
        let names: Vec<String> = locked.iter().map(|(_, n)| n.clone()).collect();

        let stages = self.env.stages.clone();
        for run in self.runs.clone() {
            self.report(sink, &format!("Running optimization run {}", run.name));
            let config = run.apply(&base);
            let structures = run.processed_structures(&config);

            for (p, name) in &locked {
                let ctx = StageContext {
                    store: store.as_ref(),
                    config: &config,
                    position: *p,
                    position_name: name,
                    scratch_dir: Some(run.dir()),
                };
                let _cleanup = PositionCleanup::new(stages.as_ref(), ctx);
                for s in &structures {
                    if let Err(e) = stages.execute_processing_scheme(&ctx, *s, false, None) {
                        record_stage_error(
                            &mut self.errors,
                            format!("run {} / position {} / structure {}", run.name, name, s),
                            "segmentAndTrack",
                            e,
                        );
                    }
                    sink.increment_subtask();
                }
                if let Err(e) = stages.perform_measurements(&ctx, MeasurementMode::EraseAll, None) {
                    record_stage_error(
                        &mut self.errors,
                        format!("run {} / position {}", run.name, name),
                        "measurements",
                        e,
                    );
                }
                sink.increment_subtask();
            }

            if let Err(e) = stages.extract_measurements(
                store.as_ref(),
                &config,
                run.dir(),
                &names,
                &run.object_classes(),
            ) {
                record_stage_error(
                    &mut self.errors,
                    format!("run {}", run.name),
                    "extractMeasurements",
                    e,
                );
            }
            sink.increment_subtask();
        }

        store.unlock_positions(&names);
        store.unlock_configuration();

        let summary = format!(
            "Optimization runs on {} finished in {:.1}s with {} error(s)",
            self.spec.store,
            started.elapsed().as_secs_f64(),
            self.errors.flatten().len()
        );
        info!(task = %self.spec.store, "{}", summary);
        if let Some(log) = &mut self.log {
            log.line("INFO", &summary);
        }
    }

    fn errors(&self) -> &ErrorAggregate {
        &self.errors
    }

    fn errors_mut(&mut self) -> &mut ErrorAggregate {
        &mut self.errors
    }

    fn set_log(&mut self, log: Option<TaskLog>) {
        self.log = log;
    }

    fn publish_errors(&mut self, sink: &ProgressSink) {
        if let Some(log) = &mut self.log {
            log.errors(&self.errors);
        }
        sink.publish_errors(&self.errors);
    }

    fn release(&mut self) {
        self.errors.clear();
        self.config = None;
    }
}
