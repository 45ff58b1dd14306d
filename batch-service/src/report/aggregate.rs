// Error Aggregate
// Ordered (context, cause) error collection with explicit flattening of nested sets

use crate::task::error::TaskError;

use std::fmt;

/// The cause half of an aggregate entry
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCause {
    /// A single error
    Error(TaskError),
    /// A pre-aggregated error set raised by a collaborator
    Nested(ErrorAggregate),
}

/// One (context, cause) entry
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
    /// Where the error happened (e.g. "position pos0 / structure 1")
    pub context: String,
    /// What happened
    pub cause: ErrorCause,
    /// Optional raw stack trace forwarded by the collaborator
    pub trace: Option<String>,
}

/// A flattened error line ready for publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatError {
    pub context: String,
    pub message: String,
    /// Filtered trace frames (may be empty)
    pub frames: Vec<String>,
}

impl fmt::Display for FlatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.context, self.message)
        }
    }
}

/// Ordered collection of errors accumulated by a task.
///
/// Entries whose cause is itself an aggregate are kept as a tree and only
/// unrolled by [`ErrorAggregate::flatten`], right before publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorAggregate {
    entries: Vec<ErrorEntry>,
}

impl ErrorAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single error under the given context
    pub fn add(&mut self, context: impl Into<String>, error: TaskError) {
        self.entries.push(ErrorEntry {
            context: context.into(),
            cause: ErrorCause::Error(error),
            trace: None,
        });
    }

    /// Record a single error with a raw stack trace attached
    pub fn add_with_trace(
        &mut self,
        context: impl Into<String>,
        error: TaskError,
        trace: Option<String>,
    ) {
        self.entries.push(ErrorEntry {
            context: context.into(),
            cause: ErrorCause::Error(error),
            trace,
        });
    }

    /// Record a collaborator's aggregate as one nested entry
    pub fn add_nested(&mut self, context: impl Into<String>, nested: ErrorAggregate) {
        if nested.is_empty() {
            return;
        }
        self.entries.push(ErrorEntry {
            context: context.into(),
            cause: ErrorCause::Nested(nested),
            trace: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of top-level entries (nested sets count once)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether any entry (at any depth) mentions the given text in its context or message
    pub fn mentions(&self, text: &str) -> bool {
        self.flatten()
            .iter()
            .any(|e| e.context.contains(text) || e.message.contains(text))
    }

    /// Unroll nested aggregates into a single ordered list.
    ///
    /// A nested entry's context is prefixed with its parent's context.
    pub fn flatten(&self) -> Vec<FlatError> {
        let mut out = Vec::new();
        flatten_into(&self.entries, "", &mut out);
        out
    }
}

fn flatten_into(entries: &[ErrorEntry], prefix: &str, out: &mut Vec<FlatError>) {
    for entry in entries {
        let context = join_context(prefix, &entry.context);
        match &entry.cause {
            ErrorCause::Error(error) => out.push(FlatError {
                context,
                message: error.to_string(),
                frames: entry
                    .trace
                    .as_deref()
                    .map(super::trace::filter_frames)
                    .unwrap_or_default(),
            }),
            ErrorCause::Nested(nested) => flatten_into(&nested.entries, &context, out),
        }
    }
}

fn join_context(prefix: &str, context: &str) -> String {
    match (prefix.is_empty(), context.is_empty()) {
        (true, _) => context.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{} > {}", prefix, context),
    }
}

impl fmt::Display for ErrorAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flat = self.flatten();
        write!(f, "{} error(s)", flat.len())?;
        for error in &flat {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorAggregate {}

impl IntoIterator for ErrorAggregate {
    type Item = FlatError;
    type IntoIter = std::vec::IntoIter<FlatError>;

    fn into_iter(self) -> Self::IntoIter {
        self.flatten().into_iter()
    }
}
