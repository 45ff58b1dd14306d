// Stages Module
// Contracts for the per-position processing stages and the optional dataset module

pub mod shell;

pub use shell::{ShellStageConfig, ShellStages};

use crate::report::ErrorAggregate;
use crate::store::{ExperimentConfig, ExperimentStore, Selection};
use crate::task::spec::{DatasetExtraction, ExportOptions, MeasurementMode, RawDatasetExtraction};

use std::io;
use std::path::Path;
use thiserror::Error;

/// What a stage collaborator returns on failure
#[derive(Debug, Error)]
pub enum StageError {
    /// One failure, optionally with a raw stack trace
    #[error("{message}")]
    Failed {
        message: String,
        trace: Option<String>,
    },

    /// A pre-aggregated error set; merged into the task as-is
    #[error("{0}")]
    Aggregate(ErrorAggregate),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            trace: None,
        }
    }
}

/// Everything a stage needs to know about the position being processed
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub store: &'a dyn ExperimentStore,
    /// Configuration in effect; differs from the store's own for alternate runs
    pub config: &'a ExperimentConfig,
    pub position: usize,
    pub position_name: &'a str,
    /// Alternate-run output directory; results must not be persisted in the store
    pub scratch_dir: Option<&'a Path>,
}

/// The per-position processing stages.
///
/// All calls happen sequentially on the executor thread.
pub trait StageRunner: Send + Sync {
    fn pre_process_images(&self, ctx: &StageContext<'_>) -> Result<(), StageError>;

    fn get_or_create_root_track(&self, ctx: &StageContext<'_>) -> Result<(), StageError>;

    fn execute_processing_scheme(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
        track_only: bool,
        selection: Option<&Selection>,
    ) -> Result<(), StageError>;

    fn generate_track_images(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
    ) -> Result<(), StageError>;

    fn perform_measurements(
        &self,
        ctx: &StageContext<'_>,
        mode: MeasurementMode,
        selection: Option<&Selection>,
    ) -> Result<(), StageError>;

    fn delete_objects(&self, ctx: &StageContext<'_>, structures: &[usize]) -> Result<(), StageError>;

    /// Flush decoded images, close inference engines and free memory held for
    /// the position. Called once per processed position, even after failures.
    fn release_position(&self, ctx: &StageContext<'_>);

    /// Write measurement tables (CSV) for the given positions and structures
    fn extract_measurements(
        &self,
        store: &dyn ExperimentStore,
        config: &ExperimentConfig,
        dir: &Path,
        positions: &[String],
        structures: &[usize],
    ) -> Result<(), StageError>;

    /// Write one archive with the requested content
    fn export_archive(
        &self,
        store: &dyn ExperimentStore,
        options: &ExportOptions,
        positions: &[String],
    ) -> Result<(), StageError>;

    /// Resident memory in bytes, when the implementation can tell
    fn memory_usage(&self) -> Option<u64> {
        None
    }
}

/// Optional dataset extraction module, injected at startup
pub trait DatasetExtractor: Send + Sync {
    fn run_task(
        &self,
        store: &dyn ExperimentStore,
        spec: &DatasetExtraction,
        positions: &[String],
    ) -> Result<(), StageError>;

    fn run_task_raw(
        &self,
        store: &dyn ExperimentStore,
        spec: &RawDatasetExtraction,
    ) -> Result<(), StageError>;
}
