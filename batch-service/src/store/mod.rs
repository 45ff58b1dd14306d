// Store Module
// Persistence collaborator contracts and the experiment configuration model

pub mod directory;

pub use directory::{DirectoryProvider, DirectoryStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};

// =============================================================================
// Experiment configuration
// =============================================================================

/// One object class in the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StructureConfig {
    pub name: String,
    /// Parent object class; `None` means the structure hangs off the position root
    #[serde(default)]
    pub parent: Option<usize>,
    /// Opaque processing-chain configuration handed to the stage collaborators
    #[serde(default)]
    pub processing_chain: Value,
}

/// One imaged field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PositionConfig {
    pub name: String,
    /// Position-specific pre-processing; `None` follows the template
    #[serde(default)]
    pub pre_processing: Option<Value>,
}

/// Experiment configuration as exposed by a store handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub structures: Vec<StructureConfig>,
    #[serde(default)]
    pub positions: Vec<PositionConfig>,
    #[serde(default)]
    pub template_pre_processing: Value,
}

impl ExperimentConfig {
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn structure_count(&self) -> usize {
        self.structures.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn all_positions(&self) -> Vec<usize> {
        (0..self.positions.len()).collect()
    }

    pub fn all_structures(&self) -> Vec<usize> {
        (0..self.structures.len()).collect()
    }

    pub fn position_name(&self, index: usize) -> Option<&str> {
        self.positions.get(index).map(|p| p.name.as_str())
    }

    pub fn position_index(&self, name: &str) -> Option<usize> {
        self.positions.iter().position(|p| p.name == name)
    }

    pub fn parent(&self, structure: usize) -> Option<usize> {
        self.structures.get(structure).and_then(|s| s.parent)
    }

    /// `structure` followed by each of its ancestors, nearest first
    pub fn path_to_root(&self, structure: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = Some(structure);
        while let Some(s) = current {
            if s >= self.structures.len() || path.contains(&s) {
                break;
            }
            path.push(s);
            current = self.parent(s);
        }
        path
    }

    pub fn is_ancestor_or_self(&self, ancestor: usize, structure: usize) -> bool {
        self.path_to_root(structure).contains(&ancestor)
    }

    pub fn has_direct_children(&self, structure: usize) -> bool {
        self.structures
            .iter()
            .any(|s| s.parent == Some(structure))
    }

    /// Deepest object class that is an ancestor-or-self of every given structure.
    /// `None` means the position root.
    pub fn first_common_parent(&self, structures: &[usize]) -> Option<usize> {
        let (first, rest) = structures.split_first()?;
        self.path_to_root(*first)
            .into_iter()
            .find(|candidate| rest.iter().all(|s| self.is_ancestor_or_self(*candidate, *s)))
    }

    /// Whether a position's own pre-processing equals the template
    pub fn pre_processing_matches_template(&self, position: usize) -> bool {
        match self.positions.get(position).and_then(|p| p.pre_processing.as_ref()) {
            None => true,
            Some(own) => *own == self.template_pre_processing,
        }
    }
}

/// A named persisted subset of objects / positions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub name: String,
    /// Object class the selection holds; `None` selects whole positions
    #[serde(default)]
    pub object_class: Option<usize>,
    /// Names of the positions the selection touches
    #[serde(default)]
    pub positions: Vec<String>,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// An opened experiment store
pub trait ExperimentStore: Send + Sync {
    fn name(&self) -> &str;

    fn dir(&self) -> &Path;

    fn config(&self) -> &ExperimentConfig;

    /// Directory where exports and extracts default to
    fn output_dir(&self) -> PathBuf;

    /// True when another process holds the configuration
    fn is_config_read_only(&self) -> bool;

    fn selection(&self, name: &str) -> Option<Selection>;

    /// Advisory lock; `false` when any of the positions is held elsewhere
    fn lock_positions(&self, positions: &[String]) -> bool;

    fn unlock_positions(&self, positions: &[String]);

    fn unlock_configuration(&self);

    /// Drop cached objects for one position, or for all when `None`
    fn clear_cache(&self, position: Option<&str>);

    fn delete_all_objects(&self) -> io::Result<()>;
}

/// Opens experiment stores by name and directory
pub trait StoreProvider: Send + Sync {
    fn open(&self, name: &str, dir: &Path, read_only: bool) -> Option<Box<dyn ExperimentStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ExperimentConfig {
        // 0: cells (root), 1: spots (in cells), 2: nuclei (in cells), 3: foci (in nuclei)
        ExperimentConfig {
            name: "exp".into(),
            structures: vec![
                StructureConfig { name: "cells".into(), parent: None, ..Default::default() },
                StructureConfig { name: "spots".into(), parent: Some(0), ..Default::default() },
                StructureConfig { name: "nuclei".into(), parent: Some(0), ..Default::default() },
                StructureConfig { name: "foci".into(), parent: Some(2), ..Default::default() },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_path_to_root() {
        assert_eq!(tree().path_to_root(3), vec![3, 2, 0]);
        assert_eq!(tree().path_to_root(0), vec![0]);
        assert!(tree().path_to_root(9).is_empty());
    }

    #[test]
    fn test_first_common_parent() {
        let config = tree();
        assert_eq!(config.first_common_parent(&[1, 3]), Some(0));
        assert_eq!(config.first_common_parent(&[3, 2]), Some(2));
        assert_eq!(config.first_common_parent(&[3]), Some(3));
        assert_eq!(config.first_common_parent(&[]), None);
    }

    #[test]
    fn test_direct_children() {
        let config = tree();
        assert!(config.has_direct_children(0));
        assert!(config.has_direct_children(2));
        assert!(!config.has_direct_children(3));
    }

    #[test]
    fn test_pre_processing_template_match() {
        let mut config = tree();
        config.template_pre_processing = serde_json::json!({"crop": true});
        config.positions = vec![
            PositionConfig { name: "a".into(), pre_processing: None },
            PositionConfig { name: "b".into(), pre_processing: Some(serde_json::json!({"crop": true})) },
            PositionConfig { name: "c".into(), pre_processing: Some(serde_json::json!({"crop": false})) },
        ];
        assert!(config.pre_processing_matches_template(0));
        assert!(config.pre_processing_matches_template(1));
        assert!(!config.pre_processing_matches_template(2));
    }
}
