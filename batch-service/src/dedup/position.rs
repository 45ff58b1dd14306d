// Position Merge
// Collapses descriptors targeting the same (store, dir, position) into the minimal stage sequence

use super::{PositionKey, ResolvedScope};
use crate::task::spec::{ExportOptions, MeasurementMode, TaskSpec};

use std::collections::BTreeMap;

/// Merge two descriptors with the same scope.
///
/// Flags are ORed, segmentation dominates track-only and erase-all dominates
/// incremental measurements. The operation is idempotent, commutative and
/// associative on the processing fields.
pub fn merge_pair(a: &TaskSpec, b: &TaskSpec) -> TaskSpec {
    let mut merged = a.clone();
    merged.pre_process = a.pre_process || b.pre_process;
    merged.segment_and_track = a.segment_and_track || b.segment_and_track;
    merged.track_only = (a.track_only || b.track_only) && !merged.segment_and_track;
    merged.generate_track_images = a.generate_track_images || b.generate_track_images;
    merged.measurements = a.measurements || b.measurements;
    merged.measurement_mode = merge_mode(a, b);
    merged
}

fn merge_mode(a: &TaskSpec, b: &TaskSpec) -> MeasurementMode {
    let erase = |t: &TaskSpec| t.measurements && t.measurement_mode == MeasurementMode::EraseAll;
    match (a.measurements, b.measurements) {
        (false, false) => MeasurementMode::default(),
        _ if erase(a) || erase(b) => MeasurementMode::EraseAll,
        _ => MeasurementMode::Incremental,
    }
}

/// Group the processing work of `units` by position.
///
/// Each unit is split into one descriptor per resolved position; descriptors
/// with identical structures and selection are merged with [`merge_pair`].
/// When a position ends up with several descriptors, pre-processing and
/// measurements are hoisted off, the track work is exploded per structure,
/// stable-sorted (structure ascending, segmentation first), reduced to one
/// entry per structure and coalesced back; pre-processing then rides on the
/// first entry and measurements on the last.
///
/// Units without a processing action or without a resolvable scope contribute
/// nothing; [`super::deduplicate`] passes the latter through. Export and
/// extraction fields are left to [`super::merge_exports`].
pub fn merge_by_position<F>(units: &[TaskSpec], resolver: F) -> BTreeMap<PositionKey, Vec<TaskSpec>>
where
    F: Fn(&TaskSpec) -> Option<ResolvedScope>,
{
    // (position, structures, selection) groups in first-appearance order
    let mut groups: BTreeMap<PositionKey, Vec<TaskSpec>> = BTreeMap::new();

    for unit in units.iter().filter(|u| u.has_processing_action()) {
        let Some(scope) = resolver(unit) else {
            continue;
        };
        let mut structures = scope.structures.clone();
        structures.sort_unstable();
        structures.dedup();

        for position in &scope.positions {
            let key = PositionKey {
                store: unit.store.clone(),
                dir: unit.dir.clone(),
                position: *position,
            };
            let split = split_for_position(unit, *position, &structures);
            let entries = groups.entry(key).or_default();
            match entries
                .iter_mut()
                .find(|e| e.structures == split.structures && e.selection == split.selection)
            {
                Some(existing) => *existing = merge_pair(existing, &split),
                None => entries.push(split),
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, entries)| {
            let merged = if entries.len() > 1 {
                minimize(entries)
            } else {
                entries
            };
            (key, merged)
        })
        .collect()
}

fn split_for_position(unit: &TaskSpec, position: usize, structures: &[usize]) -> TaskSpec {
    let mut split = unit.clone();
    split.positions = Some(vec![position]);
    split.structures = Some(structures.to_vec());
    split.export = ExportOptions::default();
    split.extract_measurement_dirs.clear();
    split.extract_dataset = None;
    split.extract_raw_dataset = None;
    if !split.measurements {
        split.measurement_mode = MeasurementMode::default();
    }
    split
}

/// One structure's share of a descriptor's track work
#[derive(Debug, Clone)]
struct Atom {
    structure: usize,
    segment: bool,
    track_only: bool,
    track_images: bool,
    selection: Option<String>,
}

impl Atom {
    fn rank(&self) -> u8 {
        match (self.segment, self.track_only) {
            (true, _) => 0,
            (false, true) => 1,
            _ => 2,
        }
    }

    fn same_work(&self, other: &Atom) -> bool {
        self.segment == other.segment
            && self.track_only == other.track_only
            && self.track_images == other.track_images
            && self.selection == other.selection
    }
}

fn minimize(entries: Vec<TaskSpec>) -> Vec<TaskSpec> {
    let pre_process = entries.iter().any(|e| e.pre_process);
    let measurements = entries.iter().any(|e| e.measurements);
    let mode = entries
        .iter()
        .filter(|e| e.measurements)
        .fold(None, |acc: Option<MeasurementMode>, e| match acc {
            Some(MeasurementMode::EraseAll) => acc,
            _ => Some(e.measurement_mode),
        })
        .unwrap_or_default();

    let template = entries[0].clone();

    let mut atoms: Vec<Atom> = entries
        .iter()
        .filter(|e| e.has_track_action() || e.generate_track_images)
        .flat_map(|e| {
            e.structures.iter().flatten().map(move |s| Atom {
                structure: *s,
                segment: e.segment_and_track,
                track_only: e.track_only,
                track_images: e.generate_track_images,
                selection: e.selection.clone(),
            })
        })
        .collect();

    let mut out = if atoms.is_empty() {
        let mut placeholder = template;
        placeholder.segment_and_track = false;
        placeholder.track_only = false;
        placeholder.generate_track_images = false;
        vec![placeholder]
    } else {
        atoms.sort_by_key(|a| (a.structure, a.rank()));
        coalesce(dedup_per_structure(atoms), &template)
    };

    if let Some(first) = out.first_mut() {
        first.pre_process = pre_process;
    }
    let last_index = out.len() - 1;
    for (i, entry) in out.iter_mut().enumerate() {
        if i != 0 {
            entry.pre_process = false;
        }
        entry.measurements = measurements && i == last_index;
        entry.measurement_mode = if entry.measurements {
            mode
        } else {
            MeasurementMode::default()
        };
    }
    out
}

/// Keep one atom per (structure, selection): the first segmentation if any,
/// otherwise the first track-only, otherwise the first image-only atom.
/// Track images are ORed into the survivor.
fn dedup_per_structure(atoms: Vec<Atom>) -> Vec<Atom> {
    let mut kept: Vec<Atom> = Vec::new();
    for atom in atoms {
        match kept
            .iter_mut()
            .find(|k| k.structure == atom.structure && k.selection == atom.selection)
        {
            Some(existing) => {
                existing.track_images |= atom.track_images;
                // sorted, so a lower rank is already in place
            }
            None => kept.push(atom),
        }
    }
    kept
}

fn coalesce(atoms: Vec<Atom>, template: &TaskSpec) -> Vec<TaskSpec> {
    let mut groups: Vec<(Atom, Vec<usize>)> = Vec::new();
    for atom in atoms {
        match groups.last_mut() {
            Some((head, structures)) if head.same_work(&atom) => structures.push(atom.structure),
            _ => {
                let structure = atom.structure;
                groups.push((atom, vec![structure]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(head, structures)| {
            let mut entry = template.clone();
            entry.structures = Some(structures);
            entry.segment_and_track = head.segment;
            entry.track_only = head.track_only && !head.segment;
            entry.generate_track_images = head.track_images;
            entry.selection = head.selection;
            entry
        })
        .collect()
}
