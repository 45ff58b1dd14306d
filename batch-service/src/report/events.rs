// Task Events
// Progress reporting channel between the executor thread and a front end

use super::progress::UserInterface;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for task progress events
pub type ProgressSender = mpsc::UnboundedSender<TaskEvent>;

/// Receiver for task progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<TaskEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while batches and daemon jobs run
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// The executor started or stopped running
    Running(bool),

    /// Overall progress, 0..=100
    Progress(u8),

    /// A readable status line
    Message(String),

    /// A published error line
    Error { context: String, message: String },

    /// A task finished (successfully or not)
    TaskCompleted {
        name: String,
        errors: usize,
        duration: Duration,
    },
}

impl TaskEvent {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }

    pub fn error(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn task_completed(name: impl Into<String>, errors: usize, duration: Duration) -> Self {
        Self::TaskCompleted {
            name: name.into(),
            errors,
            duration,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: TaskEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: TaskEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: TaskEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

/// A [`UserInterface`] that turns every call into a [`TaskEvent`]
#[derive(Debug, Clone)]
pub struct ChannelUi {
    tx: ProgressSender,
}

impl ChannelUi {
    pub fn new(tx: ProgressSender) -> Self {
        Self { tx }
    }
}

impl UserInterface for ChannelUi {
    fn set_message(&self, text: &str) {
        self.tx.send_event(TaskEvent::message(text));
    }

    fn set_error(&self, context: &str, message: &str) {
        self.tx.send_event(TaskEvent::error(context, message));
    }

    fn set_progress(&self, percent: u8) {
        self.tx.send_event(TaskEvent::Progress(percent));
    }

    fn set_running(&self, running: bool) {
        self.tx.send_event(TaskEvent::Running(running));
    }

    fn task_completed(&self, name: &str, errors: usize, duration: Duration) {
        self.tx
            .send_event(TaskEvent::task_completed(name, errors, duration));
    }
}
