//! Crate-level error types: the failure taxonomy reported to callers and the
//! Rust-side errors raised by collaborators.

use serde::{Deserialize, Serialize};

use crate::command::EditingContextId;

/// Category of a failed command, subscription, or context lookup.
///
/// Carried inside [`Failure`] so a transport layer can map each category to
/// its own wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No registered handler accepted the command.
    UnsupportedInput,
    /// The handler returned an error or panicked.
    InternalError,
    /// The caller stopped waiting, or the context shut down before the
    /// command started.
    Cancelled,
    /// The admission policy rejected the command.
    Overloaded,
    /// A subscriber fell behind its buffer capacity and was dropped.
    SubscriberOverrun,
    /// The editing context could not be resolved.
    ContextUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::UnsupportedInput => "unsupported_input",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::SubscriberOverrun => "subscriber_overrun",
            ErrorKind::ContextUnavailable => "context_unavailable",
        };
        f.write_str(name)
    }
}

/// A typed failure: the error half of an [`Outcome`](crate::Outcome).
///
/// The constructors below hold the canonical wording for each category so
/// that every handler and the session itself report failures the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable explanation.
    pub message: String,
}

impl Failure {
    /// Build a failure from a kind and a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// No handler accepts inputs of this kind.
    pub fn unsupported_input(input_kind: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedInput,
            format!("no handler accepts input of kind '{input_kind}'"),
        )
    }

    /// The handler received an input it cannot interpret.
    ///
    /// # Arguments
    ///
    /// * `found` - The kind (or shape) actually received.
    /// * `expected` - The kind the handler works with.
    pub fn invalid_input(found: &str, expected: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedInput,
            format!("invalid input '{found}', expected '{expected}'"),
        )
    }

    /// The handler faulted while processing the command.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// The caller's wait was released before a result was produced.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "the command was cancelled")
    }

    /// Admission control refused to queue the command.
    pub fn overloaded(context_id: &EditingContextId, queued: usize) -> Self {
        Self::new(
            ErrorKind::Overloaded,
            format!("editing context '{context_id}' already has {queued} queued commands"),
        )
    }

    /// The subscriber's buffer was full when an event had to be delivered.
    pub fn subscriber_overrun(capacity: usize) -> Self {
        Self::new(
            ErrorKind::SubscriberOverrun,
            format!("subscriber fell more than {capacity} events behind and was disconnected"),
        )
    }

    /// The editing context could not be resolved.
    pub fn context_unavailable(context_id: &EditingContextId, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::ContextUnavailable,
            format!("editing context '{context_id}' is unavailable: {reason}"),
        )
    }
}

/// Unexpected fault raised by a handler.
///
/// Domain-level refusals are not errors: a handler reports them as
/// [`Handled::failure`](crate::Handled::failure). A `HandlerError` means the
/// handler could not finish, and is reported to the caller as
/// [`ErrorKind::InternalError`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload could not be decoded.
    #[error("payload decoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// Any other fault, with a description.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Other`] from anything printable.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Error returned by an [`EditingContextLoader`](crate::EditingContextLoader).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// No model exists under this identifier.
    #[error("editing context '{0}' not found")]
    NotFound(EditingContextId),

    /// The model exists but could not be loaded.
    #[error("failed to load editing context: {0}")]
    Load(String),
}

/// Error returned when attaching a subscriber fails.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The session could not resolve its editing context.
    #[error(transparent)]
    ContextUnavailable(Failure),

    /// The session exited before it could register the subscriber.
    #[error("editing context session is no longer running")]
    SessionGone,
}
