// Directory Store
// Experiment store backed by a plain directory with advisory lock files

use super::{ExperimentConfig, ExperimentStore, Selection, StoreProvider};

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const CONFIG_FILE: &str = "experiment.json";
const SELECTIONS_DIR: &str = "selections";
const LOCKS_DIR: &str = "locks";
const OBJECTS_DIR: &str = "objects";
const OUTPUT_DIR: &str = "output";
const CONFIG_LOCK: &str = "configuration.lock";

/// Store rooted at `<dir>/<name>/`.
///
/// Position locks are `create_new` files under `locks/`, so two processes
/// sharing the directory never process the same position at once.
pub struct DirectoryStore {
    name: String,
    dir: PathBuf,
    root: PathBuf,
    config: ExperimentConfig,
    config_read_only: bool,
    holds_config: Mutex<bool>,
    held_positions: Mutex<HashSet<String>>,
    selection_cache: Mutex<HashMap<String, Selection>>,
}

impl DirectoryStore {
    /// Open the store; a non read-only open also tries to take the configuration lock
    pub fn open(name: &str, dir: &Path, read_only: bool) -> io::Result<Self> {
        let root = dir.join(name);
        let content = fs::read_to_string(root.join(CONFIG_FILE))?;
        let config: ExperimentConfig = serde_json::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        fs::create_dir_all(root.join(LOCKS_DIR))?;

        let holds_config = !read_only && try_create_lock(&root.join(LOCKS_DIR).join(CONFIG_LOCK))?;

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            root,
            config,
            config_read_only: read_only || !holds_config,
            holds_config: Mutex::new(holds_config),
            held_positions: Mutex::new(HashSet::new()),
            selection_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of this experiment
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self, position: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", position))
    }

    fn release_all(&self) {
        let held: Vec<String> = match self.held_positions.lock() {
            Ok(held) => held.iter().cloned().collect(),
            Err(_) => return,
        };
        self.unlock_positions(&held);
        self.unlock_configuration();
    }
}

/// Atomically create a lock file; `Ok(false)` when it already exists
fn try_create_lock(path: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

impl ExperimentStore for DirectoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    fn is_config_read_only(&self) -> bool {
        self.config_read_only
    }

    fn selection(&self, name: &str) -> Option<Selection> {
        if let Ok(cache) = self.selection_cache.lock() {
            if let Some(selection) = cache.get(name) {
                return Some(selection.clone());
            }
        }

        let path = self.root.join(SELECTIONS_DIR).join(format!("{}.json", name));
        let content = fs::read_to_string(&path).ok()?;
        let mut selection: Selection = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), "Unreadable selection: {}", e);
                return None;
            }
        };
        if selection.name.is_empty() {
            selection.name = name.to_string();
        }

        if let Ok(mut cache) = self.selection_cache.lock() {
            cache.insert(name.to_string(), selection.clone());
        }
        Some(selection)
    }

    fn lock_positions(&self, positions: &[String]) -> bool {
        let Ok(mut held) = self.held_positions.lock() else {
            return false;
        };

        let mut created = Vec::new();
        for position in positions {
            if held.contains(position) {
                continue;
            }
            match try_create_lock(&self.lock_path(position)) {
                Ok(true) => created.push(position.clone()),
                Ok(false) => {
                    debug!(position = %position, "Position already locked");
                    for p in &created {
                        let _ = fs::remove_file(self.lock_path(p));
                    }
                    return false;
                }
                Err(e) => {
                    warn!(position = %position, "Cannot create lock file: {}", e);
                    for p in &created {
                        let _ = fs::remove_file(self.lock_path(p));
                    }
                    return false;
                }
            }
        }

        held.extend(created);
        true
    }

    fn unlock_positions(&self, positions: &[String]) {
        let Ok(mut held) = self.held_positions.lock() else {
            return;
        };
        for position in positions {
            if held.remove(position) {
                if let Err(e) = fs::remove_file(self.lock_path(position)) {
                    warn!(position = %position, "Cannot remove lock file: {}", e);
                }
            }
        }
    }

    fn unlock_configuration(&self) {
        if let Ok(mut holds) = self.holds_config.lock() {
            if *holds {
                let _ = fs::remove_file(self.root.join(LOCKS_DIR).join(CONFIG_LOCK));
                *holds = false;
            }
        }
    }

    fn clear_cache(&self, position: Option<&str>) {
        if let Ok(mut cache) = self.selection_cache.lock() {
            match position {
                None => cache.clear(),
                Some(p) => cache.retain(|_, s| !s.positions.iter().any(|sp| sp == p)),
            }
        }
    }

    fn delete_all_objects(&self) -> io::Result<()> {
        let objects = self.root.join(OBJECTS_DIR);
        if objects.exists() {
            fs::remove_dir_all(&objects)?;
        }
        Ok(())
    }
}

impl Drop for DirectoryStore {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// [`StoreProvider`] opening [`DirectoryStore`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryProvider;

impl StoreProvider for DirectoryProvider {
    fn open(&self, name: &str, dir: &Path, read_only: bool) -> Option<Box<dyn ExperimentStore>> {
        match DirectoryStore::open(name, dir, read_only) {
            Ok(store) => Some(Box::new(store)),
            Err(e) => {
                warn!(store = name, dir = %dir.display(), "Cannot open store: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PositionConfig, StructureConfig};

    fn write_experiment(dir: &Path, name: &str) {
        let root = dir.join(name);
        fs::create_dir_all(root.join(SELECTIONS_DIR)).unwrap();
        let config = ExperimentConfig {
            name: name.to_string(),
            channels: vec!["phase".into()],
            structures: vec![StructureConfig {
                name: "cells".into(),
                ..Default::default()
            }],
            positions: vec![
                PositionConfig { name: "pos0".into(), pre_processing: None },
                PositionConfig { name: "pos1".into(), pre_processing: None },
            ],
            ..Default::default()
        };
        fs::write(
            root.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_open_missing_store() {
        let temp = tempfile::tempdir().unwrap();
        assert!(DirectoryProvider.open("nope", temp.path(), true).is_none());
    }

    #[test]
    fn test_position_locks_are_exclusive() {
        let temp = tempfile::tempdir().unwrap();
        write_experiment(temp.path(), "exp");

        let first = DirectoryStore::open("exp", temp.path(), false).unwrap();
        let second = DirectoryStore::open("exp", temp.path(), true).unwrap();

        assert!(first.lock_positions(&["pos0".to_string()]));
        assert!(!second.lock_positions(&["pos0".to_string()]));
        assert!(second.lock_positions(&["pos1".to_string()]));

        first.unlock_positions(&["pos0".to_string()]);
        assert!(second.lock_positions(&["pos0".to_string()]));
    }

    #[test]
    fn test_configuration_lock_makes_second_handle_read_only() {
        let temp = tempfile::tempdir().unwrap();
        write_experiment(temp.path(), "exp");

        let first = DirectoryStore::open("exp", temp.path(), false).unwrap();
        assert!(!first.is_config_read_only());
        let second = DirectoryStore::open("exp", temp.path(), false).unwrap();
        assert!(second.is_config_read_only());

        drop(first);
        let third = DirectoryStore::open("exp", temp.path(), false).unwrap();
        assert!(!third.is_config_read_only());
    }

    #[test]
    fn test_drop_releases_position_locks() {
        let temp = tempfile::tempdir().unwrap();
        write_experiment(temp.path(), "exp");

        {
            let store = DirectoryStore::open("exp", temp.path(), true).unwrap();
            assert!(store.lock_positions(&["pos0".to_string(), "pos1".to_string()]));
        }
        assert!(!temp.path().join("exp").join(LOCKS_DIR).join("pos0.lock").exists());
    }

    #[test]
    fn test_selection_loading() {
        let temp = tempfile::tempdir().unwrap();
        write_experiment(temp.path(), "exp");
        fs::write(
            temp.path().join("exp").join(SELECTIONS_DIR).join("dividing.json"),
            r#"{"objectClass": 0, "positions": ["pos1"]}"#,
        )
        .unwrap();

        let store = DirectoryStore::open("exp", temp.path(), true).unwrap();
        let selection = store.selection("dividing").unwrap();
        assert_eq!(selection.name, "dividing");
        assert_eq!(selection.object_class, Some(0));
        assert_eq!(selection.positions, vec!["pos1".to_string()]);
        assert!(store.selection("missing").is_none());
    }
}
