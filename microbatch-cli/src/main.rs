mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use batch_service::logging::{init_logging, DEFAULT_LOG_LEVEL};

use commands::daemon::DaemonArgs;
use commands::run::RunArgs;
use commands::runs::RunsArgs;
use commands::validate::ValidateArgs;

#[derive(Parser, Debug)]
#[command(name = "microbatch")]
#[command(version, about = "Batch processing and job queue for microscopy experiments", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "debug", "batch_service=trace")
    #[arg(long, global = true, value_name = "LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,

    /// Also write logs to this file (truncated on start)
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the jobs of a job file as one batch
    Run(RunArgs),

    /// Validate the jobs of a job file
    Validate(ValidateArgs),

    /// Watch a directory for job files
    Daemon(DaemonArgs),

    /// Manage optimization runs
    Runs(RunsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_level, cli.log_file.as_deref())?;

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Daemon(args) => commands::daemon::execute(args).await,
        Command::Runs(args) => commands::runs::execute(args),
    }
}
