//! Error type shared by promises, contexts, and their combinators.
//!
//! Every failed promise carries a [`PromiseError`]. The type is `Clone`
//! because a settled promise shares its terminal outcome with every
//! registered continuation and with every promise derived from it.

use std::time::Duration;

use thiserror::Error;

/// Errors that a promise can fail with.
///
/// Cancellation is normally a distinct terminal state, not an error (see
/// [`crate::promise::Outcome`]). The [`PromiseError::Cancelled`] variant
/// exists for the places where cancellation must be represented as a
/// failure, such as `join_all` aggregating a cancelled input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    /// An operation failed with a descriptive message.
    #[error("{0}")]
    Message(String),

    /// A continuation or transform panicked; the panic was caught and
    /// converted into this failure so one malformed callback cannot take
    /// down the queue executing it.
    #[error("continuation panicked: {0}")]
    Panicked(String),

    /// The operation did not settle within the deadline.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// A cancelled input observed where a failure is required.
    #[error("operation cancelled")]
    Cancelled,
}

impl PromiseError {
    /// Convenience constructor for [`PromiseError::Message`].
    pub fn msg(text: impl Into<String>) -> Self {
        PromiseError::Message(text.into())
    }
}

impl From<std::io::Error> for PromiseError {
    fn from(error: std::io::Error) -> Self {
        PromiseError::Message(error.to_string())
    }
}
