//! Resolution of editing contexts from the external model service.

use std::sync::Arc;

use crate::command::EditingContextId;
use crate::error::ContextError;

/// Loads the model behind an editing context.
///
/// Called once by each fresh session, inside its lane, before the session
/// processes its first message. The returned model is shared with the
/// handlers of that session for the session's lifetime; the model itself
/// outlives the session.
///
/// Any synchronous closure `Fn(&EditingContextId) -> Result<Arc<C>,
/// ContextError>` is a loader.
#[async_trait::async_trait]
pub trait EditingContextLoader<C>: Send + Sync + 'static {
    /// Resolve the model for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the model does not exist or cannot be
    /// loaded. Commands waiting on the session then fail with
    /// [`ErrorKind::ContextUnavailable`](crate::ErrorKind::ContextUnavailable).
    async fn load(&self, id: &EditingContextId) -> Result<Arc<C>, ContextError>;
}

#[async_trait::async_trait]
impl<C, F> EditingContextLoader<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(&EditingContextId) -> Result<Arc<C>, ContextError> + Send + Sync + 'static,
{
    async fn load(&self, id: &EditingContextId) -> Result<Arc<C>, ContextError> {
        self(id)
    }
}
