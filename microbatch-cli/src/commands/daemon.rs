use crate::commands::{print_events, StageArgs};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;
use tracing::debug;

use batch_service::{progress_channel, ChannelUi, DaemonConfig, JobQueueDaemon, ProgressSink};

/// Watch a directory and run the job files dropped into it
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Watch directory (default: ~/.microbatch/jobs)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub watch_dir: Option<PathBuf>,

    /// Seconds to sleep between scans of an idle directory
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub idle: u64,

    /// Run the jobs already present, then exit
    #[arg(long)]
    pub once: bool,

    #[command(flatten)]
    pub stages: StageArgs,
}

pub async fn execute(args: DaemonArgs) -> Result<()> {
    let env = args.stages.environment()?;

    let mut config = DaemonConfig::default().with_idle_interval(Duration::from_secs(args.idle));
    if let Some(dir) = args.watch_dir {
        config = config.with_watch_dir(dir);
    }

    let (tx, rx) = progress_channel();
    let sink = Arc::new(ProgressSink::new(Some(Arc::new(ChannelUi::new(tx)))));
    let printer = tokio::spawn(print_events(rx));

    let mut daemon = JobQueueDaemon::new(config, env, sink);
    let handle = daemon.handle();
    output::header(&format!("Watching {}", daemon.config().watch_dir.display()));

    if args.once {
        let queued = daemon.scan()?;
        output::info(&format!("{} job(s) queued", queued));
        handle.stop();
    } else {
        output::info("Ctrl-C stops after the queued jobs, a second Ctrl-C cancels");
    }

    let signals = handle.clone();
    tokio::spawn(async move {
        let mut presses = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            debug!(presses, "Interrupt received");
            if presses == 1 {
                output::warning("Stopping once the queued jobs have run");
                signals.stop();
            } else {
                output::warning("Cancelling");
                signals.cancel();
                break;
            }
        }
    });

    let report = daemon.run().await?;
    printer.await?;

    println!();
    for path in &report.relocated {
        output::item(&format!("{}", path.display()));
    }
    if report.failed > 0 {
        output::failure(&format!(
            "{} job(s) ran, {} reported errors",
            report.executed, report.failed
        ));
        std::process::exit(1);
    }
    output::success(&format!("{} job(s) ran", report.executed));
    Ok(())
}
