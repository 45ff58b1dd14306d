// Progress Sink
// Nested task/subtask counters reduced to a single percentage for the UI

use super::aggregate::ErrorAggregate;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Front-end collaborator receiving progress and messages
pub trait UserInterface: Send + Sync {
    /// Show a readable status line
    fn set_message(&self, text: &str);

    /// Show one published error line
    fn set_error(&self, context: &str, message: &str) {
        if context.is_empty() {
            self.set_message(message);
        } else {
            self.set_message(&format!("[{}] {}", context, message));
        }
    }

    /// Overall progress, 0..=100
    fn set_progress(&self, percent: u8);

    /// Whether work is currently running
    fn set_running(&self, running: bool);

    /// A task of the batch finished
    fn task_completed(&self, name: &str, errors: usize, duration: Duration) {
        self.set_message(&format!(
            "{} finished in {:.1}s with {} error(s)",
            name,
            duration.as_secs_f64(),
            errors
        ));
    }
}

/// Two nested counters (task index/total, subtask index/total) combined into one
/// 0..=100 value.
///
/// Counters are written only by the executor thread; readers on other threads
/// see a possibly stale but never torn value.
pub struct ProgressSink {
    task_index: AtomicUsize,
    task_total: AtomicUsize,
    subtask_index: AtomicUsize,
    subtask_total: AtomicUsize,
    percent: AtomicU8,
    ui: Option<Arc<dyn UserInterface>>,
}

impl ProgressSink {
    pub fn new(ui: Option<Arc<dyn UserInterface>>) -> Self {
        Self {
            task_index: AtomicUsize::new(0),
            task_total: AtomicUsize::new(1),
            subtask_index: AtomicUsize::new(0),
            subtask_total: AtomicUsize::new(0),
            percent: AtomicU8::new(0),
            ui,
        }
    }

    /// A sink that only logs
    pub fn silent() -> Self {
        Self::new(None)
    }

    pub fn ui(&self) -> Option<&Arc<dyn UserInterface>> {
        self.ui.as_ref()
    }

    /// Position the outer counter on task `index` of `total`
    pub fn set_task_counter(&self, index: usize, total: usize) {
        self.task_total.store(total.max(1), Ordering::Relaxed);
        self.task_index.store(index, Ordering::Relaxed);
        self.subtask_index.store(0, Ordering::Relaxed);
        self.subtask_total.store(0, Ordering::Relaxed);
        self.publish_percent();
    }

    /// Declare how many subtasks the current task will report
    pub fn set_subtask_total(&self, total: usize) {
        self.subtask_total.store(total, Ordering::Relaxed);
        self.subtask_index.store(0, Ordering::Relaxed);
    }

    /// One subtask of the current task is done
    pub fn increment_subtask(&self) {
        let total = self.subtask_total.load(Ordering::Relaxed);
        let current = self.subtask_index.load(Ordering::Relaxed);
        if total == 0 || current < total {
            self.subtask_index.store(current + 1, Ordering::Relaxed);
        }
        self.publish_percent();
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index.load(Ordering::Relaxed)
    }

    pub fn subtask_total(&self) -> usize {
        self.subtask_total.load(Ordering::Relaxed)
    }

    /// Last published percentage (wait-free)
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    fn compute_percent(&self) -> u8 {
        let task_total = self.task_total.load(Ordering::Relaxed).max(1) as f64;
        let task_index = self.task_index.load(Ordering::Relaxed) as f64;
        let sub_total = self.subtask_total.load(Ordering::Relaxed);
        let sub_fraction = if sub_total == 0 {
            0.0
        } else {
            self.subtask_index.load(Ordering::Relaxed) as f64 / sub_total as f64
        };
        let value = 100.0 * (task_index + sub_fraction) / task_total;
        value.clamp(0.0, 100.0).floor() as u8
    }

    fn publish_percent(&self) {
        let value = self.compute_percent();
        // Never go backwards within a run
        let previous = self.percent.fetch_max(value, Ordering::Relaxed);
        if value > previous {
            if let Some(ui) = &self.ui {
                ui.set_progress(value);
            }
        }
    }

    /// Force the percentage to a value (used at batch boundaries)
    pub fn reset(&self) {
        self.percent.store(0, Ordering::Relaxed);
        self.task_index.store(0, Ordering::Relaxed);
        self.subtask_index.store(0, Ordering::Relaxed);
        self.subtask_total.store(0, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        if let Some(ui) = &self.ui {
            ui.set_running(running);
        }
    }

    pub fn message(&self, text: &str) {
        info!("{}", text);
        if let Some(ui) = &self.ui {
            ui.set_message(text);
        }
    }

    pub fn warning(&self, text: &str) {
        warn!("{}", text);
        if let Some(ui) = &self.ui {
            ui.set_message(&format!("Warning: {}", text));
        }
    }

    /// Flatten and publish every error of the aggregate, one line each
    pub fn publish_errors(&self, errors: &ErrorAggregate) {
        for flat in errors.flatten() {
            error!(context = %flat.context, "{}", flat.message);
            if let Some(ui) = &self.ui {
                ui.set_error(&flat.context, &flat.message);
                for frame in &flat.frames {
                    ui.set_message(&format!("    at {}", frame));
                }
            }
        }
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::silent()
    }
}
