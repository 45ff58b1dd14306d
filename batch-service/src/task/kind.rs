// Unit Kinds
// Scheduling capability shared by every unit kind and the tagged job descriptor

use super::log::TaskLog;
use super::spec::TaskSpec;
use super::{Task, TaskEnvironment};
use crate::report::{ErrorAggregate, ProgressSink};
use crate::runs::{RunSpec, RunTask};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the executor, batch driver and daemon need from a unit of work
pub trait Schedulable: Send {
    /// One-line summary for logs and reports
    fn describe(&self) -> String;

    /// Check the unit against its store; errors end up in [`Schedulable::errors`]
    fn is_valid(&mut self) -> bool;

    /// Subtask increments [`Schedulable::run_task`] will report
    fn count_subtasks(&self) -> usize;

    /// Execute; failures are accumulated, never returned
    fn run_task(&mut self, sink: &ProgressSink);

    fn errors(&self) -> &ErrorAggregate;

    /// Record a failure raised outside the unit's own run (e.g. a panic)
    fn errors_mut(&mut self) -> &mut ErrorAggregate;

    /// Redirect the unit's messages to a log file, or stop redirecting
    fn set_log(&mut self, log: Option<TaskLog>);

    /// Flatten and publish the accumulated errors
    fn publish_errors(&mut self, sink: &ProgressSink);

    /// Drop the store handle and clear errors
    fn release(&mut self);
}

impl Schedulable for Task {
    fn describe(&self) -> String {
        Task::describe(self)
    }

    fn is_valid(&mut self) -> bool {
        Task::is_valid(self)
    }

    fn count_subtasks(&self) -> usize {
        Task::count_subtasks(self)
    }

    fn run_task(&mut self, sink: &ProgressSink) {
        Task::run_task(self, sink)
    }

    fn errors(&self) -> &ErrorAggregate {
        Task::errors(self)
    }

    fn errors_mut(&mut self) -> &mut ErrorAggregate {
        &mut self.errors
    }

    fn set_log(&mut self, log: Option<TaskLog>) {
        Task::set_log(self, log)
    }

    fn publish_errors(&mut self, sink: &ProgressSink) {
        Task::publish_errors(self, sink)
    }

    fn release(&mut self) {
        Task::release(self)
    }
}

/// One job line of a watch-directory file.
///
/// The `kind` field selects the unit kind; a line without it is a plain task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobDescriptor {
    Task(TaskSpec),
    OptimizationRun(RunSpec),
}

impl JobDescriptor {
    /// Parse one JSON line
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(line)?;
        if let Value::Object(map) = &mut value {
            if !map.contains_key("kind") {
                map.insert("kind".to_string(), Value::String("task".to_string()));
            }
        }
        serde_json::from_value(value)
    }

    /// Single-line JSON form, as written in job files
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Build the runnable unit for this descriptor
    pub fn into_unit(self, env: &TaskEnvironment) -> Box<dyn Schedulable> {
        match self {
            JobDescriptor::Task(spec) => Box::new(Task::new(spec, env.clone())),
            JobDescriptor::OptimizationRun(spec) => Box::new(RunTask::new(spec, env.clone())),
        }
    }

    pub fn store(&self) -> &str {
        match self {
            JobDescriptor::Task(spec) => &spec.store,
            JobDescriptor::OptimizationRun(spec) => &spec.store,
        }
    }
}

impl From<TaskSpec> for JobDescriptor {
    fn from(spec: TaskSpec) -> Self {
        JobDescriptor::Task(spec)
    }
}
