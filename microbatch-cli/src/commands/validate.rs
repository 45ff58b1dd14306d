use crate::commands::{dedup_jobs, load_jobs, StageArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use batch_service::JobDescriptor;

/// Validate the jobs of a job file against their stores without running them
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Job file: one JSON job descriptor per line
    pub jobs: PathBuf,

    /// Validate the deduplicated job list and print it
    #[arg(long)]
    pub dedup: bool,

    #[command(flatten)]
    pub stages: StageArgs,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let env = args.stages.environment()?;

    output::status("Validating", &format!("{}", args.jobs.display()));
    let mut jobs = load_jobs(&args.jobs)?;
    output::check(&format!("{} job descriptor(s) parsed", jobs.len()));

    if args.dedup {
        jobs = dedup_jobs(jobs);
        for job in &jobs {
            output::item(&JobDescriptor::to_json_line(job)?);
        }
    }

    let mut invalid = 0;
    let mut subtasks = 0;
    for job in jobs {
        let mut unit = job.into_unit(&env);
        if unit.is_valid() {
            let count = unit.count_subtasks();
            subtasks += count;
            output::check(&format!("{} ({} subtask(s))", unit.describe(), count));
        } else {
            invalid += 1;
            output::failure(&unit.describe());
            for flat in unit.errors().flatten() {
                output::error(&format!("  - {}", flat));
            }
        }
        unit.release();
    }

    println!();
    if invalid > 0 {
        output::failure(&format!("{} job(s) invalid", invalid));
        std::process::exit(1);
    }
    output::success(&format!("All jobs valid, {} subtask(s) in total", subtasks));
    Ok(())
}
