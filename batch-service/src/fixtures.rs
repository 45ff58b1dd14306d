// Test Fixtures
// In-memory store and recording stage runner shared by unit tests

use crate::report::ErrorAggregate;
use crate::stages::{StageContext, StageError, StageRunner};
use crate::store::{
    ExperimentConfig, ExperimentStore, PositionConfig, Selection, StoreProvider, StructureConfig,
};
use crate::task::error::TaskError;
use crate::task::spec::{ExportOptions, MeasurementMode};
use crate::task::TaskEnvironment;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// `positions` positions named pos0.., `structures` structures where every
/// structure after the first is a child of structure 0
pub fn experiment(positions: usize, structures: usize) -> ExperimentConfig {
    ExperimentConfig {
        name: "exp".to_string(),
        channels: vec!["phase".to_string(), "fluo".to_string()],
        structures: (0..structures)
            .map(|i| StructureConfig {
                name: format!("s{}", i),
                parent: if i == 0 { None } else { Some(0) },
                processing_chain: serde_json::json!({ "chain": i }),
            })
            .collect(),
        positions: (0..positions)
            .map(|i| PositionConfig {
                name: format!("pos{}", i),
                pre_processing: None,
            })
            .collect(),
        template_pre_processing: serde_json::Value::Null,
    }
}

pub fn memory_store(positions: usize, structures: usize) -> MemoryStore {
    MemoryProvider::new(experiment(positions, structures)).build_store(true)
}

pub struct MemoryStore {
    config: ExperimentConfig,
    dir: PathBuf,
    read_only: bool,
    selections: HashMap<String, Selection>,
    lock_failures: HashSet<String>,
    locked: Mutex<HashSet<String>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl MemoryStore {
    fn note(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

impl ExperimentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    fn is_config_read_only(&self) -> bool {
        self.read_only
    }

    fn selection(&self, name: &str) -> Option<Selection> {
        self.selections.get(name).cloned()
    }

    fn lock_positions(&self, positions: &[String]) -> bool {
        if positions.iter().any(|p| self.lock_failures.contains(p)) {
            return false;
        }
        let mut locked = self.locked.lock().unwrap();
        for p in positions {
            locked.insert(p.clone());
            self.note(format!("lock {}", p));
        }
        true
    }

    fn unlock_positions(&self, positions: &[String]) {
        let mut locked = self.locked.lock().unwrap();
        for p in positions {
            if locked.remove(p) {
                self.note(format!("unlock {}", p));
            }
        }
    }

    fn unlock_configuration(&self) {
        self.note("unlock configuration".to_string());
    }

    fn clear_cache(&self, position: Option<&str>) {
        self.note(format!("clear cache {}", position.unwrap_or("*")));
    }

    fn delete_all_objects(&self) -> io::Result<()> {
        self.note("delete all objects".to_string());
        Ok(())
    }
}

/// Provider handing out [`MemoryStore`]s over one shared configuration
#[derive(Clone)]
pub struct MemoryProvider {
    pub config: ExperimentConfig,
    pub selections: HashMap<String, Selection>,
    pub lock_failures: HashSet<String>,
    pub available: bool,
    pub dir: PathBuf,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub opens: Arc<AtomicUsize>,
}

impl MemoryProvider {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            selections: HashMap::new(),
            lock_failures: HashSet::new(),
            available: true,
            dir: PathBuf::from("/nonexistent/memory-store"),
            journal: Arc::new(Mutex::new(Vec::new())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selections.insert(selection.name.clone(), selection);
        self
    }

    pub fn failing_lock(mut self, position: &str) -> Self {
        self.lock_failures.insert(position.to_string());
        self
    }

    /// Root the store under a real directory (for code that writes next to it)
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn build_store(&self, read_only: bool) -> MemoryStore {
        MemoryStore {
            config: self.config.clone(),
            dir: self.dir.clone(),
            read_only,
            selections: self.selections.clone(),
            lock_failures: self.lock_failures.clone(),
            locked: Mutex::new(HashSet::new()),
            journal: self.journal.clone(),
        }
    }
}

impl StoreProvider for MemoryProvider {
    fn open(&self, _name: &str, _dir: &Path, read_only: bool) -> Option<Box<dyn ExperimentStore>> {
        if !self.available {
            return None;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(self.build_store(read_only)))
    }
}

/// Stage runner recording every call as a readable string
#[derive(Default)]
pub struct RecordingStages {
    calls: Mutex<Vec<String>>,
    failures: HashSet<(usize, usize)>,
    aggregate_failures: HashSet<(usize, usize)>,
    panics: HashSet<usize>,
}

impl RecordingStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `execute_processing_scheme` fail for (position, structure)
    pub fn fail_structure(mut self, position: usize, structure: usize) -> Self {
        self.failures.insert((position, structure));
        self
    }

    /// Same, but the failure is a pre-aggregated error set
    pub fn fail_with_aggregate(mut self, position: usize, structure: usize) -> Self {
        self.aggregate_failures.insert((position, structure));
        self
    }

    /// Panic while pre-processing the position
    pub fn panic_on(mut self, position: usize) -> Self {
        self.panics.insert(position);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl StageRunner for RecordingStages {
    fn pre_process_images(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        if self.panics.contains(&ctx.position) {
            panic!("decoder crashed on {}", ctx.position_name);
        }
        self.record(format!("preProcess {}", ctx.position_name));
        Ok(())
    }

    fn get_or_create_root_track(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        self.record(format!("rootTrack {}", ctx.position_name));
        Ok(())
    }

    fn execute_processing_scheme(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
        track_only: bool,
        selection: Option<&Selection>,
    ) -> Result<(), StageError> {
        let mode = if track_only { "track" } else { "segment" };
        let chain = ctx
            .config
            .structures
            .get(structure)
            .map(|s| s.processing_chain.to_string())
            .unwrap_or_default();
        let mut call = format!("{} {} s{} {}", mode, ctx.position_name, structure, chain);
        if let Some(selection) = selection {
            call.push_str(&format!(" sel={}", selection.name));
        }
        if ctx.scratch_dir.is_some() {
            call.push_str(" scratch");
        }
        self.record(call);

        if self.failures.contains(&(ctx.position, structure)) {
            return Err(StageError::failed(format!(
                "segmentation diverged for s{}",
                structure
            )));
        }
        if self.aggregate_failures.contains(&(ctx.position, structure)) {
            let mut agg = ErrorAggregate::new();
            agg.add("frame 0", TaskError::stage("tracker", "no link"));
            agg.add("frame 1", TaskError::stage("tracker", "no link"));
            return Err(StageError::Aggregate(agg));
        }
        Ok(())
    }

    fn generate_track_images(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
    ) -> Result<(), StageError> {
        self.record(format!("trackImages {} s{}", ctx.position_name, structure));
        Ok(())
    }

    fn perform_measurements(
        &self,
        ctx: &StageContext<'_>,
        mode: MeasurementMode,
        _selection: Option<&Selection>,
    ) -> Result<(), StageError> {
        self.record(format!("measure {} {}", ctx.position_name, mode.as_str()));
        Ok(())
    }

    fn delete_objects(&self, ctx: &StageContext<'_>, structures: &[usize]) -> Result<(), StageError> {
        self.record(format!("delete {} {:?}", ctx.position_name, structures));
        Ok(())
    }

    fn release_position(&self, ctx: &StageContext<'_>) {
        self.record(format!("release {}", ctx.position_name));
    }

    fn extract_measurements(
        &self,
        _store: &dyn ExperimentStore,
        _config: &ExperimentConfig,
        dir: &Path,
        positions: &[String],
        structures: &[usize],
    ) -> Result<(), StageError> {
        self.record(format!(
            "extract {} {:?} {:?}",
            dir.display(),
            positions,
            structures
        ));
        Ok(())
    }

    fn export_archive(
        &self,
        _store: &dyn ExperimentStore,
        _options: &ExportOptions,
        positions: &[String],
    ) -> Result<(), StageError> {
        self.record(format!("export {:?}", positions));
        Ok(())
    }
}

/// Environment over a memory provider and a recording stage runner
pub fn environment(provider: &MemoryProvider, stages: &Arc<RecordingStages>) -> TaskEnvironment {
    TaskEnvironment::new(Arc::new(provider.clone()), stages.clone())
}
