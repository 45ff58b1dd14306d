// Background Executor
// Runs indexed sub-units sequentially on one blocking thread with cancellation and completion hooks

use crate::report::ProgressSink;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Failure of one sub-unit, forwarded to the completion path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("Sub-unit {index} failed: {message}")]
    Failed { index: usize, message: String },

    #[error("Sub-unit {index} panicked: {message}")]
    Panicked { index: usize, message: String },
}

/// An ordered list of sub-units
pub trait SubUnits: Send + 'static {
    fn count(&self) -> usize;

    /// Run sub-unit `index`; a returned non-empty message is relayed to the UI
    fn run(&mut self, index: usize, sink: &ProgressSink) -> Result<Option<String>, ExecutorError>;

    /// Sub-unit `index` panicked; nothing runs after it
    fn panicked(&mut self, _index: usize, _message: &str) {}
}

/// What happened to a batch, handed to hooks and returned with the work
#[derive(Debug)]
pub struct ExecutionOutcome<W> {
    pub work: W,
    pub completed: usize,
    pub total: usize,
    pub cancelled: bool,
    pub failure: Option<ExecutorError>,
}

impl<W> ExecutionOutcome<W> {
    /// Every sub-unit ran and none failed
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failure.is_none() && self.completed == self.total
    }
}

type CompletionHook<W> = Box<dyn FnOnce(&ExecutionOutcome<W>) + Send>;

/// Single-threaded executor for one batch of sub-units
pub struct BackgroundExecutor<W: SubUnits> {
    work: W,
    sink: Arc<ProgressSink>,
    cancel: CancellationToken,
    hooks: Vec<CompletionHook<W>>,
}

impl<W: SubUnits> BackgroundExecutor<W> {
    pub fn new(work: W, sink: Arc<ProgressSink>) -> Self {
        Self {
            work,
            sink,
            cancel: CancellationToken::new(),
            hooks: Vec::new(),
        }
    }

    /// Share a cancellation token with the caller (e.g. a daemon's)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Append a completion hook; hooks run in the order they were added
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&ExecutionOutcome<W>) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Run on the blocking thread pool
    pub fn spawn(self) -> JoinHandle<ExecutionOutcome<W>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Run on the current thread.
    ///
    /// Cancellation is checked before each sub-unit. A failing or panicking
    /// sub-unit halts the batch; the failure lands in the outcome and the
    /// hooks still run.
    pub fn run(self) -> ExecutionOutcome<W> {
        let BackgroundExecutor {
            mut work,
            sink,
            cancel,
            hooks,
        } = self;

        let total = work.count();
        let mut completed = 0;
        let mut cancelled = false;
        let mut failure = None;

        sink.set_running(true);
        for index in 0..total {
            if cancel.is_cancelled() {
                debug!(index, total, "Cancelled before sub-unit");
                cancelled = true;
                break;
            }

            match catch_unwind(AssertUnwindSafe(|| work.run(index, &sink))) {
                Ok(Ok(message)) => {
                    completed += 1;
                    sink.set_task_counter(completed, total);
                    if let Some(text) = message.filter(|m| !m.is_empty()) {
                        sink.message(&text);
                    }
                }
                Ok(Err(e)) => {
                    warn!(index, "{}", e);
                    failure = Some(e);
                    break;
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    work.panicked(index, &message);
                    let e = ExecutorError::Panicked { index, message };
                    error!(index, "{}", e);
                    failure = Some(e);
                    break;
                }
            }
        }
        sink.set_running(false);

        let outcome = ExecutionOutcome {
            work,
            completed,
            total,
            cancelled,
            failure,
        };
        for hook in hooks {
            hook(&outcome);
        }
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
