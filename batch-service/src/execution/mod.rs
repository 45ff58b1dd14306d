// Execution Module
// Background executor and the batch driver feeding it

pub mod batch;
pub mod executor;

// Re-export key types
pub use batch::{BatchDriver, BatchError};
pub use executor::{BackgroundExecutor, ExecutionOutcome, ExecutorError, SubUnits};
