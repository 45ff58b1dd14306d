// Reporting Module
// Error aggregation, progress counters and the UI event channel

pub mod aggregate;
pub mod events;
pub mod progress;
pub mod trace;

// Re-export key types
pub use aggregate::{ErrorAggregate, ErrorCause, ErrorEntry, FlatError};
pub use events::{progress_channel, ChannelUi, EventSender, ProgressReceiver, ProgressSender, TaskEvent};
pub use progress::{ProgressSink, UserInterface};
