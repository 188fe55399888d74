//! Action-level error type.

use thiserror::Error;

/// Errors returned by an [`Executor`](crate::Executor) for one dispatch.
///
/// The engine records the variant on the step instead of propagating it:
/// - `Failed`: the step turns `ERROR` with the message verbatim.
/// - `Cancelled`: the dispatch observed a cancellation signal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The external action ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The dispatch was abandoned after a cancellation signal.
    #[error("dispatch cancelled")]
    Cancelled,
}
