// Task Descriptor
// Serializable description of one unit of batch work (one JSON line in a job file)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How measurements treat previously stored values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MeasurementMode {
    /// Delete every stored measurement before measuring
    #[default]
    EraseAll,
    /// Only compute measurements that are missing
    Incremental,
}

impl MeasurementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementMode::EraseAll => "eraseAll",
            MeasurementMode::Incremental => "incremental",
        }
    }
}

/// Extract measurement tables for some structures into a directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementExtraction {
    pub dir: PathBuf,
    /// Structures to extract; empty means all
    #[serde(rename = "s", default)]
    pub structures: Vec<usize>,
}

/// Archive export of the processed positions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default)]
    pub objects: bool,
    #[serde(default)]
    pub pre_processed_images: bool,
    #[serde(default)]
    pub track_images: bool,
    #[serde(default)]
    pub config: bool,
    #[serde(default)]
    pub selections: bool,
    /// Archive path; defaults to the store's output directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl ExportOptions {
    pub fn is_requested(&self) -> bool {
        self.objects || self.pre_processed_images || self.track_images || self.config || self.selections
    }

    /// Union of two export requests; the first explicit file wins
    pub fn union(&self, other: &ExportOptions) -> ExportOptions {
        ExportOptions {
            objects: self.objects || other.objects,
            pre_processed_images: self.pre_processed_images || other.pre_processed_images,
            track_images: self.track_images || other.track_images,
            config: self.config || other.config,
            selections: self.selections || other.selections,
            file: self.file.clone().or_else(|| other.file.clone()),
        }
    }
}

/// One feature column of an extracted dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSpec {
    pub name: String,
    /// Feature extractor identifier understood by the dataset module
    pub extractor: String,
    pub object_class: usize,
}

/// Dataset extraction request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetExtraction {
    pub output_file: PathBuf,
    #[serde(default)]
    pub selections: Vec<String>,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    /// Output image width and height
    pub dimensions: [u32; 2],
    /// Object classes whose touching contours are erased
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erase_touching_contours: Option<Vec<usize>>,
}

/// Spatial bounds of a raw dataset extraction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
    #[serde(default)]
    pub z_min: i64,
    #[serde(default)]
    pub z_max: i64,
}

/// Raw (unprocessed image) dataset extraction request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawDatasetExtraction {
    pub output_file: PathBuf,
    #[serde(default)]
    pub channels: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    /// Frames to extract, keyed by position name
    #[serde(default)]
    pub frames: BTreeMap<String, Vec<i64>>,
}

/// Serializable job descriptor.
///
/// `positions`/`structures` left as `None` mean "all" and are resolved lazily
/// against the store during validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Experiment store name
    #[serde(alias = "dbName")]
    pub store: String,
    /// Directory holding the store
    pub dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structures: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,

    #[serde(default)]
    pub pre_process: bool,
    #[serde(default)]
    pub segment_and_track: bool,
    #[serde(default)]
    pub track_only: bool,
    #[serde(default)]
    pub measurements: bool,
    #[serde(default)]
    pub measurement_mode: MeasurementMode,
    #[serde(default)]
    pub generate_track_images: bool,

    #[serde(default)]
    pub export: ExportOptions,
    #[serde(default, rename = "extractMeasurementDir")]
    pub extract_measurement_dirs: Vec<MeasurementExtraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_dataset: Option<DatasetExtraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_raw_dataset: Option<RawDatasetExtraction>,
}

impl TaskSpec {
    pub fn new(store: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the processing actions; segmentation dominates track-only
    pub fn with_actions(
        mut self,
        pre_process: bool,
        segment_and_track: bool,
        track_only: bool,
        measurements: bool,
    ) -> Self {
        self.pre_process = pre_process;
        self.segment_and_track = segment_and_track;
        self.track_only = track_only && !segment_and_track;
        self.measurements = measurements;
        self
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.positions = Some(positions.into_iter().collect());
        self
    }

    pub fn with_structures(mut self, structures: impl IntoIterator<Item = usize>) -> Self {
        self.structures = Some(structures.into_iter().collect());
        self
    }

    pub fn with_selection(mut self, selection: impl Into<String>) -> Self {
        self.selection = Some(selection.into());
        self
    }

    pub fn with_measurement_mode(mut self, mode: MeasurementMode) -> Self {
        self.measurement_mode = mode;
        self
    }

    pub fn with_track_images(mut self, generate: bool) -> Self {
        self.generate_track_images = generate;
        self
    }

    pub fn with_export(mut self, export: ExportOptions) -> Self {
        self.export = export;
        self
    }

    pub fn add_extract_measurement_dir(
        mut self,
        dir: impl Into<PathBuf>,
        structures: impl IntoIterator<Item = usize>,
    ) -> Self {
        self.extract_measurement_dirs.push(MeasurementExtraction {
            dir: dir.into(),
            structures: structures.into_iter().collect(),
        });
        self
    }

    pub fn with_dataset(mut self, dataset: DatasetExtraction) -> Self {
        self.extract_dataset = Some(dataset);
        self
    }

    pub fn with_raw_dataset(mut self, raw: RawDatasetExtraction) -> Self {
        self.extract_raw_dataset = Some(raw);
        self
    }

    /// Whether any per-position stage is requested
    pub fn has_processing_action(&self) -> bool {
        self.pre_process
            || self.segment_and_track
            || self.track_only
            || self.measurements
            || self.generate_track_images
    }

    /// Whether any export or extraction is requested
    pub fn has_export_intent(&self) -> bool {
        self.export.is_requested()
            || !self.extract_measurement_dirs.is_empty()
            || self.extract_dataset.is_some()
            || self.extract_raw_dataset.is_some()
    }

    pub fn has_any_action(&self) -> bool {
        self.has_processing_action() || self.has_export_intent()
    }

    pub fn has_track_action(&self) -> bool {
        self.segment_and_track || self.track_only
    }

    /// One-line human readable summary
    pub fn describe(&self) -> String {
        let mut actions = Vec::new();
        if self.pre_process {
            actions.push("preProcess".to_string());
        }
        if self.segment_and_track {
            actions.push("segmentAndTrack".to_string());
        }
        if self.track_only {
            actions.push("trackOnly".to_string());
        }
        if self.generate_track_images {
            actions.push("trackImages".to_string());
        }
        if self.measurements {
            actions.push(format!("measurements({})", self.measurement_mode.as_str()));
        }
        if !self.extract_measurement_dirs.is_empty() {
            actions.push(format!("extract x{}", self.extract_measurement_dirs.len()));
        }
        if self.export.is_requested() {
            actions.push("export".to_string());
        }
        if self.extract_dataset.is_some() {
            actions.push("dataset".to_string());
        }
        if self.extract_raw_dataset.is_some() {
            actions.push("rawDataset".to_string());
        }

        format!(
            "{} ({}) positions={} structures={}{} [{}]",
            self.store,
            self.dir.display(),
            format_indices(self.positions.as_deref()),
            format_indices(self.structures.as_deref()),
            self.selection
                .as_ref()
                .map(|s| format!(" selection={}", s))
                .unwrap_or_default(),
            actions.join(", ")
        )
    }
}

fn format_indices(indices: Option<&[usize]>) -> String {
    match indices {
        None => "all".to_string(),
        Some(list) => format!(
            "[{}]",
            list.iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_wire_format() {
        let json = r#"{
            "store": "exp1",
            "dir": "/data",
            "positions": [0, 2],
            "structures": [1],
            "segmentAndTrack": true,
            "measurements": true,
            "measurementMode": "incremental",
            "extractMeasurementDir": [{"dir": "/out", "s": [0, 1]}],
            "extractRawDataset": {"outputFile": "/out/raw.h5", "channels": [0], "frames": {"pos0": [0, 1]}}
        }"#;

        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.store, "exp1");
        assert_eq!(spec.positions, Some(vec![0, 2]));
        assert!(spec.segment_and_track);
        assert!(!spec.pre_process);
        assert_eq!(spec.measurement_mode, MeasurementMode::Incremental);
        assert_eq!(spec.extract_measurement_dirs[0].structures, vec![0, 1]);
        assert_eq!(
            spec.extract_raw_dataset.unwrap().frames.get("pos0"),
            Some(&vec![0, 1])
        );
    }

    #[test]
    fn test_db_name_alias_and_defaults() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{"dbName": "exp", "dir": "/d", "preProcess": true}"#).unwrap();
        assert_eq!(spec.store, "exp");
        assert!(spec.positions.is_none());
        assert!(spec.structures.is_none());
        assert_eq!(spec.measurement_mode, MeasurementMode::EraseAll);
    }

    #[test]
    fn test_segmentation_dominates_track_only() {
        let spec = TaskSpec::new("e", "/d").with_actions(false, true, true, false);
        assert!(spec.segment_and_track);
        assert!(!spec.track_only);
    }

    #[test]
    fn test_action_queries() {
        let empty = TaskSpec::new("e", "/d");
        assert!(!empty.has_any_action());

        let export = TaskSpec::new("e", "/d").with_export(ExportOptions {
            config: true,
            ..Default::default()
        });
        assert!(export.has_export_intent());
        assert!(!export.has_processing_action());

        let extract = TaskSpec::new("e", "/d").add_extract_measurement_dir("/out", [1]);
        assert!(extract.has_any_action());
    }

    #[test]
    fn test_describe() {
        let spec = TaskSpec::new("exp", "/d")
            .with_positions([0, 3])
            .with_actions(true, false, true, true);
        let text = spec.describe();
        assert!(text.contains("positions=[0,3]"));
        assert!(text.contains("structures=all"));
        assert!(text.contains("preProcess, trackOnly, measurements(eraseAll)"));
    }
}
