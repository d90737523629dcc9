//! Handler contract and the typed closure adapter.
//!
//! A [`Handler`] owns the domain logic for one family of inputs. The session
//! calls it with the editing context's mutation lane already held, so a
//! handler never has to coordinate with other handlers of the same context.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::{Command, Outcome};
use crate::error::{ErrorKind, Failure, HandlerError};
use crate::event::ChangeKind;

/// Boxed future returned by [`FnHandler`] closures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler hands back to the session: the caller's outcome and the
/// changes to broadcast.
///
/// Changes are only broadcast when the handler returns `Ok`, so producing the
/// result and emitting events are one step from the subscribers' point of
/// view.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    /// Outcome returned to the caller.
    pub outcome: Outcome,
    /// Changes to broadcast, in order. Empty for pure reads.
    pub changes: Vec<ChangeKind>,
}

impl Handled {
    /// Successful outcome with no changes.
    pub fn success(value: Value) -> Self {
        Self {
            outcome: Outcome::Success(value),
            changes: Vec::new(),
        }
    }

    /// Failed outcome with no changes.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure(Failure::new(kind, message)),
            changes: Vec::new(),
        }
    }

    /// Append a change to broadcast.
    pub fn with_change(mut self, kind: impl Into<ChangeKind>) -> Self {
        self.changes.push(kind.into());
        self
    }
}

impl From<Failure> for Handled {
    fn from(failure: Failure) -> Self {
        Self {
            outcome: Outcome::Failure(failure),
            changes: Vec::new(),
        }
    }
}

/// A unit of domain logic that acts on commands against an editing context
/// of type `C`.
///
/// # Contract
///
/// - [`can_handle`](Handler::can_handle) must be pure. It is used for routing
///   and checked again right before [`handle`](Handler::handle).
/// - [`handle`](Handler::handle) runs with exclusive mutation rights on the
///   context and must not start concurrent mutations of it.
/// - Changes are reported only through the returned [`Handled`]. Returning
///   `Err` (or panicking) yields an internal error and no changes.
#[async_trait::async_trait]
pub trait Handler<C>: Send + Sync + 'static {
    /// Whether this handler accepts `command`.
    fn can_handle(&self, context: &C, command: &Command) -> bool;

    /// Act on the command.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the handler could not finish; the caller
    /// then receives [`ErrorKind::InternalError`].
    async fn handle(&self, context: &C, command: &Command) -> Result<Handled, HandlerError>;
}

/// Adapter turning an async closure over a typed payload into a [`Handler`].
///
/// Accepts commands whose input kind equals `kind`, decodes the input data
/// into `T` and passes it to the closure. Data that does not decode answers
/// [`ErrorKind::UnsupportedInput`] without calling the closure.
///
/// # Examples
///
/// ```
/// use sirius_dispatch::{FnHandler, Handled, HandlerError};
/// use serde_json::json;
///
/// struct Model;
///
/// let echo = FnHandler::new("echo", |_model: &Model, text: String| {
///     Box::pin(async move { Ok::<_, HandlerError>(Handled::success(json!(text)).with_change("echoed")) })
/// });
/// ```
pub struct FnHandler<C, T, F> {
    kind: String,
    func: F,
    _marker: PhantomData<fn(&C, T)>,
}

impl<C, T, F> FnHandler<C, T, F>
where
    F: for<'a> Fn(&'a C, T) -> BoxFuture<'a, Result<Handled, HandlerError>> + Send + Sync + 'static,
{
    /// Create a handler for inputs tagged `kind`.
    pub fn new(kind: impl Into<String>, func: F) -> Self {
        Self {
            kind: kind.into(),
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<C, T, F> Handler<C> for FnHandler<C, T, F>
where
    C: Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    F: for<'a> Fn(&'a C, T) -> BoxFuture<'a, Result<Handled, HandlerError>> + Send + Sync + 'static,
{
    fn can_handle(&self, _context: &C, command: &Command) -> bool {
        command.kind() == self.kind
    }

    async fn handle(&self, context: &C, command: &Command) -> Result<Handled, HandlerError> {
        let payload: T = match command.input().data_as() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(kind = %self.kind, error = %e, "payload did not decode");
                return Ok(Failure::invalid_input(&command.input().data().to_string(), &self.kind).into());
            }
        };
        (self.func)(context, payload).await
    }
}
