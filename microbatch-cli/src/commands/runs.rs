use crate::output;

use std::fs;
use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use batch_service::AlternateRunRegistry;

/// Manage the optimization runs of a store
#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Store name
    #[arg(long, short = 's')]
    pub store: String,

    /// Directory holding the store
    #[arg(long, short = 'd', value_name = "DIR")]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: RunsCommand,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommand {
    /// List the runs that have at least one configuration
    List,

    /// Create an empty run directory
    Create { name: String },

    /// Save the processing chain (JSON file) of one object class
    Save {
        name: String,
        object_class: usize,
        chain: PathBuf,
    },

    /// Remove the configuration of one object class
    Remove { name: String, object_class: usize },
}

pub fn execute(args: RunsArgs) -> Result<()> {
    let mut registry = AlternateRunRegistry::for_existing_store(&args.dir, &args.store)?;

    match args.command {
        RunsCommand::List => {
            output::header(&format!(
                "{} run(s) in {}",
                registry.runs().len(),
                registry.root().display()
            ));
            for run in registry.runs() {
                output::item(&format!("{} {:?}", run.name(), run.object_classes()));
            }
        }
        RunsCommand::Create { name } => {
            let dir = registry.create_run(&name)?;
            output::success(&format!("Created {}", dir.display()));
            output::info("The run is listed once a configuration is saved");
        }
        RunsCommand::Save {
            name,
            object_class,
            chain,
        } => {
            let content = fs::read_to_string(&chain)
                .wrap_err_with(|| format!("Cannot read {}", chain.display()))?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .wrap_err_with(|| format!("{} is not valid JSON", chain.display()))?;
            registry.save_config(&name, object_class, &value)?;
            output::success(&format!("Saved object class {} of run '{}'", object_class, name));
        }
        RunsCommand::Remove { name, object_class } => {
            if !registry.remove_config(&name, object_class)? {
                bail!("Run '{}' has no configuration for object class {}", name, object_class);
            }
            output::success(&format!("Removed object class {} of run '{}'", object_class, name));
        }
    }
    Ok(())
}
