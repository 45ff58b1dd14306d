// Dedup Module
// Pure functions collapsing a batch of task descriptors into the minimal equivalent set

pub mod export;
pub mod position;

pub use export::merge_exports;
pub use position::{merge_by_position, merge_pair};

use crate::store::{ExperimentConfig, StoreProvider};
use crate::task::spec::TaskSpec;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Identity of one position of one experiment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey {
    pub store: String,
    pub dir: PathBuf,
    pub position: usize,
}

/// Positions and structures a descriptor covers once "all" is expanded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedScope {
    pub positions: Vec<usize>,
    pub structures: Vec<usize>,
}

impl ResolvedScope {
    /// Scope from explicit filters only; unresolved filters stay empty
    pub fn explicit(spec: &TaskSpec) -> Self {
        Self {
            positions: spec.positions.clone().unwrap_or_default(),
            structures: spec.structures.clone().unwrap_or_default(),
        }
    }

    /// Scope with "all" expanded against an experiment configuration
    pub fn against(spec: &TaskSpec, config: &ExperimentConfig) -> Self {
        Self {
            positions: spec
                .positions
                .clone()
                .unwrap_or_else(|| config.all_positions()),
            structures: spec
                .structures
                .clone()
                .unwrap_or_else(|| config.all_structures()),
        }
    }
}

/// Resolves "all" filters by reading each experiment's configuration once
pub struct StoreScopeResolver<'a> {
    provider: &'a dyn StoreProvider,
    configs: Mutex<HashMap<(String, PathBuf), Option<ExperimentConfig>>>,
}

impl<'a> StoreScopeResolver<'a> {
    pub fn new(provider: &'a dyn StoreProvider) -> Self {
        Self {
            provider,
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when a filter needs the store and the store cannot be opened
    pub fn resolve(&self, spec: &TaskSpec) -> Option<ResolvedScope> {
        if spec.positions.is_some() && spec.structures.is_some() {
            return Some(ResolvedScope::explicit(spec));
        }

        let mut configs = self.configs.lock().ok()?;
        let config = configs
            .entry((spec.store.clone(), spec.dir.clone()))
            .or_insert_with(|| {
                let store = self.provider.open(&spec.store, &spec.dir, true)?;
                let config = store.config().clone();
                store.unlock_configuration();
                Some(config)
            });
        match config {
            Some(config) => Some(ResolvedScope::against(spec, config)),
            None => {
                warn!(store = %spec.store, "Cannot resolve scope, store unavailable");
                None
            }
        }
    }
}

/// Full deduplication pass: the per-position processing entries in key
/// order, followed by one export-only descriptor per experiment.
///
/// Units whose scope cannot be resolved are returned unchanged at the end so
/// that validation reports them.
pub fn deduplicate<F>(units: &[TaskSpec], resolver: F) -> Vec<TaskSpec>
where
    F: Fn(&TaskSpec) -> Option<ResolvedScope>,
{
    let (resolvable, unresolved): (Vec<TaskSpec>, Vec<TaskSpec>) = units
        .iter()
        .cloned()
        .partition(|unit| resolver(unit).is_some());
    if !unresolved.is_empty() {
        warn!(units = unresolved.len(), "Passing unresolved units through unmerged");
    }

    let mut out: Vec<TaskSpec> = merge_by_position(&resolvable, &resolver)
        .into_values()
        .flatten()
        .collect();
    out.extend(merge_exports(&resolvable, &resolver));
    out.extend(unresolved);
    out
}
