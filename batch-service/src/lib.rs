// Batch Service Library
// Task scheduling, deduplication and job-queue execution for microscopy experiments

pub mod daemon;
pub mod dedup;
pub mod error;
pub mod execution;
pub mod logging;
pub mod report;
pub mod runs;
pub mod stages;
pub mod store;
pub mod task;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export reporting types
pub use report::{
    progress_channel, ChannelUi, ErrorAggregate, FlatError, ProgressReceiver, ProgressSender,
    ProgressSink, TaskEvent, UserInterface,
};

// Re-export collaborator types
pub use stages::{DatasetExtractor, ShellStageConfig, ShellStages, StageRunner};
pub use store::{DirectoryProvider, ExperimentConfig, ExperimentStore, StoreProvider};

// Re-export task types
pub use task::{JobDescriptor, Schedulable, Task, TaskEnvironment, TaskError, TaskSpec};

// Re-export scheduling types
pub use daemon::{DaemonConfig, DaemonHandle, DaemonReport, JobQueueDaemon};
pub use dedup::{deduplicate, StoreScopeResolver};
pub use execution::{BatchDriver, BatchError, ExecutionOutcome};
pub use runs::{AlternateRunRegistry, RunSpec, RunTask};
