//! Change notifications broadcast to the subscribers of an editing context.
//!
//! A [`ChangeEvent`] only says "the model behind this context changed,
//! because of that command". It carries no diff: subscribers fetch the
//! current state of whatever they render on their own.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::command::{CorrelationId, EditingContextId};

/// What kind of change a handler reports.
///
/// Handlers may use any string; the associated constants cover the kinds
/// that representation refreshers commonly react to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeKind(String);

impl ChangeKind {
    /// Nothing changed. Accepted from handlers, never broadcast.
    pub const NOTHING: &'static str = "NOTHING";
    /// The semantic model was modified.
    pub const SEMANTIC_CHANGE: &'static str = "SEMANTIC_CHANGE";
    /// A representation was created.
    pub const REPRESENTATION_CREATION: &'static str = "REPRESENTATION_CREATION";
    /// A representation was deleted.
    pub const REPRESENTATION_DELETION: &'static str = "REPRESENTATION_DELETION";
    /// A representation was renamed.
    pub const REPRESENTATION_RENAMING: &'static str = "REPRESENTATION_RENAMING";
    /// A representation must be deleted by its owner.
    pub const REPRESENTATION_TO_DELETE: &'static str = "REPRESENTATION_TO_DELETE";
    /// A representation must be renamed by its owner.
    pub const REPRESENTATION_TO_RENAME: &'static str = "REPRESENTATION_TO_RENAME";

    /// Wrap a kind name.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The `NOTHING` kind.
    pub fn nothing() -> Self {
        Self::new(Self::NOTHING)
    }

    /// The `SEMANTIC_CHANGE` kind.
    pub fn semantic_change() -> Self {
        Self::new(Self::SEMANTIC_CHANGE)
    }

    /// Borrow the kind name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether events of this kind are worth broadcasting.
    pub fn is_broadcast(&self) -> bool {
        self.0 != Self::NOTHING
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// A change notification produced by one command on one editing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The editing context whose model changed.
    pub context_id: EditingContextId,
    /// Correlation id of the command that caused the change.
    pub cause: CorrelationId,
    /// What changed.
    pub kind: ChangeKind,
    /// Production ordinal within the session, starting at 1.
    ///
    /// Strictly increasing for a given session; a fresh session for the
    /// same context starts again at 1.
    pub sequence: u64,
    /// Wall-clock emission time in milliseconds since the Unix epoch.
    pub emitted_at: u64,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Clocks set before the epoch report `0` rather than failing.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Stamps handler-reported change kinds into [`ChangeEvent`]s.
///
/// Owned by the session lane, so sequence numbers follow execution order.
#[derive(Debug)]
pub(crate) struct EventStamper {
    context_id: EditingContextId,
    next_sequence: u64,
}

impl EventStamper {
    pub(crate) fn new(context_id: EditingContextId) -> Self {
        Self {
            context_id,
            next_sequence: 1,
        }
    }

    /// Turn the changes of one command into events, dropping `NOTHING`.
    pub(crate) fn stamp(&mut self, cause: &CorrelationId, changes: Vec<ChangeKind>) -> Vec<ChangeEvent> {
        let emitted_at = now_millis();
        changes
            .into_iter()
            .filter(ChangeKind::is_broadcast)
            .map(|kind| {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                ChangeEvent {
                    context_id: self.context_id.clone(),
                    cause: cause.clone(),
                    kind,
                    sequence,
                    emitted_at,
                }
            })
            .collect()
    }
}
