// Shell Stages
// Stage runner that delegates every stage to a configured shell command

use super::{StageContext, StageError, StageRunner};
use crate::store::{ExperimentConfig, ExperimentStore, Selection};
use crate::task::spec::{ExportOptions, MeasurementMode};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Shell command per stage; a missing command makes that stage a no-op
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShellStageConfig {
    /// Shell executable (default `sh`, invoked with `-c`)
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub pre_process: Option<String>,
    #[serde(default)]
    pub root_track: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub track_images: Option<String>,
    #[serde(default)]
    pub measurements: Option<String>,
    #[serde(default)]
    pub delete_objects: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub extract_measurements: Option<String>,
    #[serde(default)]
    pub export: Option<String>,
    /// Extra environment passed to every command
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ShellStageConfig {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// [`StageRunner`] running `sh -c <command>` per stage.
///
/// The command sees the stage inputs as `MICROBATCH_*` environment variables.
pub struct ShellStages {
    config: ShellStageConfig,
}

impl ShellStages {
    pub fn new(config: ShellStageConfig) -> Self {
        Self { config }
    }

    fn run(
        &self,
        stage: &str,
        command: Option<&String>,
        working_dir: &Path,
        env: HashMap<String, String>,
    ) -> Result<(), StageError> {
        let Some(command) = command else {
            debug!(stage, "No command configured, skipping");
            return Ok(());
        };

        let shell = self.config.shell.as_deref().unwrap_or("sh");
        let mut cmd = Command::new(shell);
        cmd.arg("-c");
        cmd.arg(command);
        if working_dir.is_dir() {
            cmd.current_dir(working_dir);
        }
        cmd.envs(&self.config.env);
        cmd.envs(&env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .map_err(|e| StageError::failed(format!("Failed to execute {}: {}", shell, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(stage, "{}", line);
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no error output")
            .to_string();
        let exit = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!(stage, exit = %exit, "Stage command failed");

        Err(StageError::Failed {
            message: format!("exit code {}: {}", exit, reason),
            trace: if stderr.trim().is_empty() {
                None
            } else {
                Some(stderr)
            },
        })
    }
}

fn base_env(store: &dyn ExperimentStore) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("MICROBATCH_STORE".to_string(), store.name().to_string());
    env.insert(
        "MICROBATCH_DIR".to_string(),
        store.dir().display().to_string(),
    );
    env
}

fn position_env(ctx: &StageContext<'_>) -> HashMap<String, String> {
    let mut env = base_env(ctx.store);
    env.insert(
        "MICROBATCH_POSITION".to_string(),
        ctx.position_name.to_string(),
    );
    env.insert(
        "MICROBATCH_POSITION_INDEX".to_string(),
        ctx.position.to_string(),
    );
    let output = ctx
        .scratch_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.store.output_dir());
    env.insert(
        "MICROBATCH_OUTPUT_DIR".to_string(),
        output.display().to_string(),
    );
    env.insert(
        "MICROBATCH_SCRATCH".to_string(),
        ctx.scratch_dir.is_some().to_string(),
    );
    env
}

fn join_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn add_selection(env: &mut HashMap<String, String>, selection: Option<&Selection>) {
    if let Some(selection) = selection {
        env.insert("MICROBATCH_SELECTION".to_string(), selection.name.clone());
    }
}

impl StageRunner for ShellStages {
    fn pre_process_images(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let mut env = position_env(ctx);
        let config = ctx
            .config
            .positions
            .get(ctx.position)
            .and_then(|p| p.pre_processing.clone())
            .unwrap_or_else(|| ctx.config.template_pre_processing.clone());
        env.insert("MICROBATCH_PRE_PROCESSING".to_string(), config.to_string());
        self.run("preProcess", self.config.pre_process.as_ref(), ctx.store.dir(), env)
    }

    fn get_or_create_root_track(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        self.run(
            "rootTrack",
            self.config.root_track.as_ref(),
            ctx.store.dir(),
            position_env(ctx),
        )
    }

    fn execute_processing_scheme(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
        track_only: bool,
        selection: Option<&Selection>,
    ) -> Result<(), StageError> {
        let mut env = position_env(ctx);
        env.insert("MICROBATCH_STRUCTURE".to_string(), structure.to_string());
        env.insert("MICROBATCH_TRACK_ONLY".to_string(), track_only.to_string());
        if let Some(s) = ctx.config.structures.get(structure) {
            env.insert(
                "MICROBATCH_PROCESSING_CHAIN".to_string(),
                s.processing_chain.to_string(),
            );
        }
        add_selection(&mut env, selection);
        self.run("process", self.config.process.as_ref(), ctx.store.dir(), env)
    }

    fn generate_track_images(
        &self,
        ctx: &StageContext<'_>,
        structure: usize,
    ) -> Result<(), StageError> {
        let mut env = position_env(ctx);
        env.insert("MICROBATCH_STRUCTURE".to_string(), structure.to_string());
        self.run(
            "trackImages",
            self.config.track_images.as_ref(),
            ctx.store.dir(),
            env,
        )
    }

    fn perform_measurements(
        &self,
        ctx: &StageContext<'_>,
        mode: MeasurementMode,
        selection: Option<&Selection>,
    ) -> Result<(), StageError> {
        let mut env = position_env(ctx);
        env.insert(
            "MICROBATCH_MEASUREMENT_MODE".to_string(),
            mode.as_str().to_string(),
        );
        add_selection(&mut env, selection);
        self.run(
            "measurements",
            self.config.measurements.as_ref(),
            ctx.store.dir(),
            env,
        )
    }

    fn delete_objects(&self, ctx: &StageContext<'_>, structures: &[usize]) -> Result<(), StageError> {
        let mut env = position_env(ctx);
        env.insert("MICROBATCH_STRUCTURES".to_string(), join_indices(structures));
        self.run(
            "deleteObjects",
            self.config.delete_objects.as_ref(),
            ctx.store.dir(),
            env,
        )
    }

    fn release_position(&self, ctx: &StageContext<'_>) {
        if let Err(e) = self.run(
            "release",
            self.config.release.as_ref(),
            ctx.store.dir(),
            position_env(ctx),
        ) {
            warn!(position = ctx.position_name, "Release command failed: {}", e);
        }
    }

    fn extract_measurements(
        &self,
        store: &dyn ExperimentStore,
        _config: &ExperimentConfig,
        dir: &Path,
        positions: &[String],
        structures: &[usize],
    ) -> Result<(), StageError> {
        let mut env = base_env(store);
        env.insert(
            "MICROBATCH_EXTRACT_DIR".to_string(),
            dir.display().to_string(),
        );
        env.insert("MICROBATCH_POSITIONS".to_string(), positions.join(","));
        env.insert("MICROBATCH_STRUCTURES".to_string(), join_indices(structures));
        self.run(
            "extractMeasurements",
            self.config.extract_measurements.as_ref(),
            store.dir(),
            env,
        )
    }

    fn export_archive(
        &self,
        store: &dyn ExperimentStore,
        options: &ExportOptions,
        positions: &[String],
    ) -> Result<(), StageError> {
        let mut env = base_env(store);
        let file = options
            .file
            .clone()
            .unwrap_or_else(|| store.output_dir().join(format!("{}_export.zip", store.name())));
        env.insert("MICROBATCH_EXPORT_FILE".to_string(), file.display().to_string());
        env.insert("MICROBATCH_POSITIONS".to_string(), positions.join(","));
        env.insert(
            "MICROBATCH_EXPORT_OBJECTS".to_string(),
            options.objects.to_string(),
        );
        env.insert(
            "MICROBATCH_EXPORT_PRE_PROCESSED".to_string(),
            options.pre_processed_images.to_string(),
        );
        env.insert(
            "MICROBATCH_EXPORT_TRACK_IMAGES".to_string(),
            options.track_images.to_string(),
        );
        env.insert(
            "MICROBATCH_EXPORT_CONFIG".to_string(),
            options.config.to_string(),
        );
        env.insert(
            "MICROBATCH_EXPORT_SELECTIONS".to_string(),
            options.selections.to_string(),
        );
        self.run("export", self.config.export.as_ref(), store.dir(), env)
    }
}
