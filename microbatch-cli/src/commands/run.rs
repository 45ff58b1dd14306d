use crate::commands::{dedup_jobs, load_jobs, print_events, StageArgs};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Args;
use color_eyre::Result;

use batch_service::{progress_channel, BatchDriver, ChannelUi, ProgressSink, Schedulable};

/// Run every job of a job file as one batch
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job file: one JSON job descriptor per line
    pub jobs: PathBuf,

    /// Merge redundant task descriptors before running
    #[arg(long)]
    pub dedup: bool,

    #[command(flatten)]
    pub stages: StageArgs,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let env = args.stages.environment()?;

    output::status("Loading", &format!("{}", args.jobs.display()));
    let mut jobs = load_jobs(&args.jobs)?;
    if args.dedup {
        jobs = dedup_jobs(jobs);
    }
    if jobs.is_empty() {
        output::warning("No jobs to run");
        return Ok(());
    }

    let units: Vec<Box<dyn Schedulable>> = jobs.into_iter().map(|job| job.into_unit(&env)).collect();

    output::status("Validating", &format!("{} job(s)", units.len()));
    let (driver, rejected) = BatchDriver::split_valid(units);
    for unit in &rejected {
        output::failure(&format!("Invalid, not run: {}", unit.describe()));
    }

    let mut finished: Vec<Box<dyn Schedulable>> = Vec::new();
    let mut halted = false;
    let started = Instant::now();

    if driver.is_empty() {
        output::warning("No valid jobs to run");
    } else {
        output::header(&format!(
            "Running {} job(s), {} subtask(s)",
            driver.len(),
            driver.total_subtasks()
        ));

        let (tx, rx) = progress_channel();
        let sink = Arc::new(ProgressSink::new(Some(Arc::new(ChannelUi::new(tx)))));
        let printer = tokio::spawn(print_events(rx));

        let executor = driver.executor(sink.clone());
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Interrupted, stopping after the current job");
                token.cancel();
            }
        });

        let outcome = executor.spawn().await?;

        // The sink holds the last sender; dropping it lets the printer drain and finish
        drop(sink);
        printer.await?;

        if let Some(failure) = &outcome.failure {
            output::failure(&format!("Batch halted: {}", failure));
        }
        if outcome.cancelled {
            output::warning(&format!(
                "Cancelled after {}/{} job(s)",
                outcome.completed, outcome.total
            ));
        }
        halted = !outcome.is_complete();
        finished = outcome.work.into_units();
    }

    println!();
    let failed = report_errors(&rejected) + report_errors(&finished);
    let total = rejected.len() + finished.len();
    let elapsed = started.elapsed().as_secs_f64();

    if failed == 0 && !halted {
        output::success(&format!("{} job(s) completed in {:.2}s", total, elapsed));
        Ok(())
    } else {
        output::failure(&format!(
            "{} of {} job(s) reported errors ({:.2}s)",
            failed, total, elapsed
        ));
        std::process::exit(1);
    }
}

/// Print every unit's collected errors; returns the number of units with errors
pub fn report_errors(units: &[Box<dyn Schedulable>]) -> usize {
    let mut failed = 0;
    for unit in units {
        let errors = unit.errors().flatten();
        if errors.is_empty() {
            continue;
        }
        failed += 1;
        output::header(&format!("{} ({} error(s))", unit.describe(), errors.len()));
        for flat in &errors {
            output::error(&format!("  - {}", flat));
        }
    }
    failed
}
