//! Command envelope, identifiers, and command results.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, Failure};

/// Identifier of one shared, mutable model instance.
///
/// Stable for the lifetime of the model. Sessions are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditingContextId(String);

impl EditingContextId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EditingContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EditingContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EditingContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier correlating a command with its result and the change events
/// it caused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an identifier supplied by the caller.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random (UUID v4) identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Tagged input carried by a [`Command`].
///
/// `kind` names the variant (e.g. `"echo"` or
/// `"getSelectionDescriptionMessage"`) and `data` holds its content. Handlers
/// route on `kind` and decode `data` with [`Input::data_as`].
///
/// # Examples
///
/// ```
/// use sirius_dispatch::Input;
/// use serde_json::json;
///
/// let input = Input::new("renameRepresentation", json!({"newLabel": "Main"}));
/// assert_eq!(input.kind(), "renameRepresentation");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Input {
    /// Build an input from its tag and content.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// The variant tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The raw content.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Decode the content into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `data` does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// An immutable request to act on an editing context.
///
/// One command is one dispatch attempt and yields exactly one
/// [`CommandResult`] carrying the same [`CorrelationId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: CorrelationId,
    input: Input,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
}

impl Command {
    /// Build a command with an explicit correlation id.
    pub fn new(id: impl Into<CorrelationId>, input: Input) -> Self {
        Self {
            id: id.into(),
            input,
            actor: None,
        }
    }

    /// Build a command with a generated correlation id.
    pub fn with_random_id(input: Input) -> Self {
        Self::new(CorrelationId::random(), input)
    }

    /// Record who issued the command. Used for tracing only.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Correlation id of this command.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// The tagged input.
    pub fn input(&self) -> &Input {
        &self.input
    }

    /// Shorthand for `self.input().kind()`.
    pub fn kind(&self) -> &str {
        self.input.kind()
    }

    /// Identity of the issuer, if provided.
    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }
}

/// Terminal state of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler produced a value.
    Success(Value),
    /// The command failed.
    Failure(Failure),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Kind of the failure, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure.kind),
        }
    }

    /// Convert into a standard `Result`.
    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

/// The single answer to a dispatched command, delivered to its caller only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Correlation id of the command this result answers.
    pub correlation_id: CorrelationId,
    /// What happened.
    pub outcome: Outcome,
}

impl CommandResult {
    /// Build a successful result.
    pub fn success(correlation_id: CorrelationId, value: Value) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Success(value),
        }
    }

    /// Build a failed result.
    pub fn failure(correlation_id: CorrelationId, failure: Failure) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Failure(failure),
        }
    }

    /// Kind of the failure, if the command failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.error_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn random_correlation_ids_differ() {
        assert_ne!(CorrelationId::random(), CorrelationId::random());
    }

    #[test]
    fn ids_convert_from_owned_strings() {
        let n = 7;
        let cmd = Command::new(format!("c{n}"), Input::new("echo", json!(null)));
        assert_eq!(cmd.id().as_str(), "c7");

        let ctx = EditingContextId::from(String::from("ctx-7"));
        assert_eq!(ctx, EditingContextId::new("ctx-7"));
    }

    #[test]
    fn command_exposes_input_kind() {
        let cmd = Command::new("c1", Input::new("echo", json!("hello")));
        assert_eq!(cmd.id().as_str(), "c1");
        assert_eq!(cmd.kind(), "echo");
        assert_eq!(cmd.actor(), None);
    }

    #[test]
    fn with_actor_sets_issuer() {
        let cmd = Command::with_random_id(Input::new("echo", Value::Null)).with_actor("user-42");
        assert_eq!(cmd.actor(), Some("user-42"));
    }

    #[test]
    fn data_as_decodes_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        struct Rename {
            new_label: String,
        }

        let input = Input::new("rename", json!({"newLabel": "Main"}));
        let payload: Rename = input.data_as().expect("payload should decode");
        assert_eq!(payload.new_label, "Main");
    }

    #[test]
    fn data_as_rejects_mismatched_payload() {
        let input = Input::new("rename", json!(42));
        assert!(input.data_as::<String>().is_err());
    }

    #[test]
    fn input_without_data_defaults_to_null() {
        let input: Input =
            serde_json::from_str(r#"{"kind":"ping"}"#).expect("deserialization should succeed");
        assert_eq!(input.kind(), "ping");
        assert!(input.data().is_null());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let result = CommandResult::success(CorrelationId::new("c1"), json!("hello"));
        let value = serde_json::to_value(&result).expect("serialization should succeed");
        assert_eq!(
            value,
            json!({"correlation_id": "c1", "outcome": {"status": "success", "value": "hello"}})
        );
    }

    #[test]
    fn failure_result_reports_error_kind() {
        let result = CommandResult::failure(CorrelationId::new("c2"), Failure::cancelled());
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        assert!(!result.outcome.is_success());
    }

    #[test]
    fn into_result_unwraps_success() {
        let value = Outcome::Success(json!(1)).into_result().expect("should be Ok");
        assert_eq!(value, json!(1));
    }
}
