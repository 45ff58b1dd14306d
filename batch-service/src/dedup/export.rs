// Export Merge
// One export-only descriptor per experiment, carrying the union of every export request

use super::ResolvedScope;
use crate::task::spec::TaskSpec;

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Merge the export and extraction fields of `units` per (store, dir).
///
/// Export flags are ORed, extraction directories are concatenated without
/// duplicates and the positions are the union of every contributing unit's
/// resolved positions. The first dataset and raw dataset requests win. Units
/// without export intent or without a resolvable scope contribute nothing.
pub fn merge_exports<F>(units: &[TaskSpec], resolver: F) -> Vec<TaskSpec>
where
    F: Fn(&TaskSpec) -> Option<ResolvedScope>,
{
    let mut merged: BTreeMap<(String, PathBuf), TaskSpec> = BTreeMap::new();

    for unit in units.iter().filter(|u| u.has_export_intent()) {
        let Some(scope) = resolver(unit) else {
            continue;
        };
        let entry = merged
            .entry((unit.store.clone(), unit.dir.clone()))
            .or_insert_with(|| {
                let mut export = TaskSpec::new(unit.store.clone(), unit.dir.clone());
                export.positions = Some(Vec::new());
                export
            });

        entry.export = entry.export.union(&unit.export);
        for extraction in &unit.extract_measurement_dirs {
            if !entry.extract_measurement_dirs.contains(extraction) {
                entry.extract_measurement_dirs.push(extraction.clone());
            }
        }
        if entry.extract_dataset.is_none() {
            entry.extract_dataset = unit.extract_dataset.clone();
        }
        if entry.extract_raw_dataset.is_none() {
            entry.extract_raw_dataset = unit.extract_raw_dataset.clone();
        }
        if let Some(positions) = entry.positions.as_mut() {
            positions.extend(scope.positions);
            positions.sort_unstable();
            positions.dedup();
        }
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spec::{ExportOptions, MeasurementExtraction, RawDatasetExtraction};

    fn explicit(spec: &TaskSpec) -> Option<ResolvedScope> {
        Some(ResolvedScope::explicit(spec))
    }

    #[test]
    fn test_union_per_experiment() {
        let units = vec![
            TaskSpec::new("exp", "/d")
                .with_positions([2, 0])
                .with_actions(false, true, false, false)
                .add_extract_measurement_dir("/out", [1])
                .with_export(ExportOptions {
                    objects: true,
                    file: Some("/out/a.zip".into()),
                    ..Default::default()
                }),
            TaskSpec::new("exp", "/d")
                .with_positions([1, 2])
                .add_extract_measurement_dir("/out", [1])
                .add_extract_measurement_dir("/out2", [])
                .with_export(ExportOptions {
                    config: true,
                    file: Some("/out/b.zip".into()),
                    ..Default::default()
                }),
            // processing only: contributes nothing
            TaskSpec::new("exp", "/d")
                .with_positions([7])
                .with_actions(true, false, false, false),
        ];

        let merged = merge_exports(&units, explicit);
        assert_eq!(merged.len(), 1);
        let export = &merged[0];
        assert_eq!(export.positions, Some(vec![0, 1, 2]));
        assert!(export.export.objects && export.export.config);
        assert_eq!(export.export.file, Some("/out/a.zip".into()));
        assert_eq!(
            export.extract_measurement_dirs,
            vec![
                MeasurementExtraction { dir: "/out".into(), structures: vec![1] },
                MeasurementExtraction { dir: "/out2".into(), structures: vec![] },
            ]
        );
        assert!(!export.has_processing_action());
    }

    #[test]
    fn test_separate_experiments_and_first_dataset_wins() {
        let raw = |file: &str| RawDatasetExtraction {
            output_file: file.into(),
            channels: vec![0],
            bounds: None,
            frames: Default::default(),
        };
        let units = vec![
            TaskSpec::new("b", "/d").with_positions([0]).with_raw_dataset(raw("/first.h5")),
            TaskSpec::new("a", "/d").with_positions([0]).with_raw_dataset(raw("/other.h5")),
            TaskSpec::new("b", "/d").with_positions([3]).with_raw_dataset(raw("/second.h5")),
        ];

        let merged = merge_exports(&units, explicit);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].store, "a");
        assert_eq!(merged[1].store, "b");
        assert_eq!(
            merged[1].extract_raw_dataset.as_ref().unwrap().output_file,
            PathBuf::from("/first.h5")
        );
        assert_eq!(merged[1].positions, Some(vec![0, 3]));
    }
}
