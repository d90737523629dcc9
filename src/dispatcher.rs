//! Top-level entry point: routes commands and subscriptions to per-context
//! sessions, spawning and retiring them on demand.
//!
//! The dispatcher is built via [`DispatcherBuilder`], which collects the
//! handler registry, the editing-context loader, and session tuning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::admission::{AdmissionPolicy, Unbounded};
use crate::command::{Command, CommandResult, EditingContextId};
use crate::context::EditingContextLoader;
use crate::error::{ErrorKind, Failure, SubscribeError};
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use crate::session::{
    NoopLifecycle, SessionConfig, SessionFactory, SessionHandle, SessionLifecycle, SessionMessage,
    SessionState,
};
use crate::subscription::Subscription;

/// Live sessions keyed by editing context.
type SessionMap = HashMap<EditingContextId, SessionHandle>;

/// How many times a request is re-routed when it races with a session
/// retiring underneath it.
const MAX_ROUTING_ATTEMPTS: usize = 3;

/// Routes commands to the serialized session of their editing context.
///
/// Commands on the same editing context run one at a time in arrival order;
/// commands on different contexts run concurrently. Every submitted command
/// is answered with exactly one [`CommandResult`].
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use sirius_dispatch::{
///     Command, ContextError, Dispatcher, EditingContextId, FnHandler, Handled, HandlerError,
///     Input,
/// };
///
/// # async fn example() {
/// let dispatcher = Dispatcher::builder(|_id: &EditingContextId| Ok::<_, ContextError>(Arc::new(())))
///     .handler(FnHandler::new("echo", |_ctx: &(), text: String| {
///         Box::pin(async move {
///             Ok::<_, HandlerError>(Handled::success(json!(text)).with_change("echoed"))
///         })
///     }))
///     .build();
///
/// let ctx = EditingContextId::new("ctx-1");
/// let result = dispatcher
///     .submit(&ctx, Command::new("c1", Input::new("echo", json!("hello"))))
///     .await;
/// assert!(result.outcome.is_success());
/// # }
/// ```
pub struct Dispatcher<C> {
    sessions: Arc<RwLock<SessionMap>>,
    factory: Arc<SessionFactory<C>>,
    admission: Arc<dyn AdmissionPolicy>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            factory: Arc::clone(&self.factory),
            admission: Arc::clone(&self.admission),
        }
    }
}

// Manual `Debug`: handlers and loaders are not `Debug`.
impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.factory.registry)
            .field("config", &self.factory.config)
            .finish_non_exhaustive()
    }
}

impl<C> Dispatcher<C>
where
    C: Send + Sync + 'static,
{
    /// Start building a dispatcher around `loader`.
    pub fn builder<L>(loader: L) -> DispatcherBuilder<C>
    where
        L: EditingContextLoader<C>,
    {
        DispatcherBuilder::new(loader)
    }

    /// Submit a command to an editing context and wait for its result.
    ///
    /// The command joins the tail of the context's queue, spawning the
    /// context's session if none is live. The returned future resolves once
    /// the command has run, or earlier if it was rejected.
    ///
    /// Dropping the returned future before the command starts withdraws it:
    /// the session skips it. Dropping it mid-execution does not abort the
    /// handler.
    ///
    /// # Returns
    ///
    /// The command's [`CommandResult`]. Rejections are reported in its
    /// outcome, never as a panic or a hang:
    ///
    /// * [`ErrorKind::UnsupportedInput`] - no handler accepts the command.
    /// * [`ErrorKind::InternalError`] - the handler failed or panicked.
    /// * [`ErrorKind::Overloaded`] - the admission policy refused it.
    /// * [`ErrorKind::Cancelled`] - the context shut down before it started.
    /// * [`ErrorKind::ContextUnavailable`] - the context could not be loaded.
    pub async fn submit(&self, context_id: &EditingContextId, command: Command) -> CommandResult {
        let correlation_id = command.id().clone();
        let reply = match self.enqueue(context_id, command).await {
            Ok(reply) => reply,
            Err(rejected) => return rejected,
        };
        match reply.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    context_id = %context_id,
                    correlation_id = %correlation_id,
                    "session stopped without answering"
                );
                CommandResult::failure(
                    correlation_id,
                    Failure::internal("session stopped without answering the command"),
                )
            }
        }
    }

    /// Submit a command, giving up when `cancel` completes first.
    ///
    /// If `cancel` wins while the command is still queued, the command is
    /// withdrawn and never runs. If the command was already running it runs
    /// to completion, but its result is discarded.
    ///
    /// # Returns
    ///
    /// The command's result, or a [`ErrorKind::Cancelled`] failure if
    /// `cancel` completed first.
    pub async fn submit_until<F>(
        &self,
        context_id: &EditingContextId,
        command: Command,
        cancel: F,
    ) -> CommandResult
    where
        F: Future<Output = ()>,
    {
        let correlation_id = command.id().clone();
        tokio::select! {
            result = self.submit(context_id, command) => result,
            () = cancel => {
                tracing::debug!(
                    context_id = %context_id,
                    correlation_id = %correlation_id,
                    "command cancelled by caller"
                );
                CommandResult::failure(correlation_id, Failure::cancelled())
            }
        }
    }

    /// Attach a subscriber to an editing context's change events.
    ///
    /// The subscriber receives every event produced after this call returns,
    /// in production order. Earlier events are not replayed.
    ///
    /// # Errors
    ///
    /// * [`SubscribeError::ContextUnavailable`] - the context cannot be loaded.
    /// * [`SubscribeError::SessionGone`] - the context kept retiring while
    ///   the subscription was being set up.
    pub async fn subscribe(&self, context_id: &EditingContextId) -> Result<Subscription, SubscribeError> {
        for _ in 0..MAX_ROUTING_ATTEMPTS {
            let session = self.session(context_id).await;
            let (reply, rx) = oneshot::channel();
            if session.sender.send(SessionMessage::Subscribe { reply }).is_err() {
                continue;
            }
            match rx.await {
                Ok(Ok(subscription)) => return Ok(subscription),
                // Retiring underneath us: the next lookup waits it out.
                Ok(Err(SubscribeError::SessionGone)) | Err(_) => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
        Err(SubscribeError::SessionGone)
    }

    /// Detach a subscriber. Its stream ends.
    ///
    /// Dropping the [`Subscription`] has the same effect; this call
    /// additionally frees the session-side slot right away.
    ///
    /// Subscriber ids are unique across sessions, so a session that replaced
    /// the one the subscription came from never matches it. Retiring
    /// sessions are skipped: they drop every subscriber themselves.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(subscription.context_id())
            && session.is_alive()
        {
            let _ = session.sender.send(SessionMessage::Unsubscribe {
                id: subscription.id(),
            });
        }
    }

    /// Lifecycle state of the context's most recent session, if one was
    /// ever spawned.
    pub async fn session_state(&self, context_id: &EditingContextId) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(context_id).map(SessionHandle::state)
    }

    /// Editing contexts with a live session.
    pub async fn live_sessions(&self) -> Vec<EditingContextId> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, session)| session.is_alive())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Shut down one context's session and wait until it has retired.
    ///
    /// The running command, if any, completes. Queued commands are answered
    /// with [`ErrorKind::Cancelled`] and subscriptions end. A later command
    /// for the same context starts a fresh session, but only once this one
    /// has retired.
    ///
    /// # Returns
    ///
    /// `true` if this call shut down a live session.
    pub async fn shutdown_context(&self, context_id: &EditingContextId) -> bool {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(context_id).cloned()
        };
        let Some(session) = session else {
            return false;
        };
        let was_alive = session.is_alive() && session.request_shutdown();
        session.retired().await;
        was_alive
    }

    /// Shut down every session and wait until they have all retired.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        tracing::info!(sessions = sessions.len(), "shutting down dispatcher");
        for session in &sessions {
            session.request_shutdown();
        }
        for session in &sessions {
            session.retired().await;
        }
    }

    /// Enqueue `command` on its context's session.
    ///
    /// # Returns
    ///
    /// The receiver the session will answer on, or the rejection result.
    async fn enqueue(
        &self,
        context_id: &EditingContextId,
        command: Command,
    ) -> Result<oneshot::Receiver<CommandResult>, CommandResult> {
        let correlation_id = command.id().clone();
        let mut command = command;

        for _ in 0..MAX_ROUTING_ATTEMPTS {
            let session = self.session(context_id).await;

            if let Err(queued) = session.depth.try_reserve(self.admission.as_ref(), context_id) {
                tracing::warn!(
                    context_id = %context_id,
                    correlation_id = %correlation_id,
                    queued,
                    "command rejected by admission policy"
                );
                return Err(CommandResult::failure(
                    correlation_id,
                    Failure::overloaded(context_id, queued),
                ));
            }

            let (reply, rx) = oneshot::channel();
            match session.sender.send(SessionMessage::Execute { command, reply }) {
                Ok(()) => return Ok(rx),
                Err(mpsc::error::SendError(message)) => {
                    // Retired between lookup and send: the next lookup waits
                    // for it and routes to a fresh session.
                    session.depth.release();
                    let SessionMessage::Execute { command: returned, .. } = message else {
                        return Err(CommandResult::failure(
                            correlation_id,
                            Failure::internal("session returned an unexpected message"),
                        ));
                    };
                    command = returned;
                }
            }
        }

        Err(CommandResult::failure(
            correlation_id,
            Failure::new(
                ErrorKind::ContextUnavailable,
                format!("no session for editing context '{context_id}' stayed up long enough"),
            ),
        ))
    }

    /// Get the live session for `context_id`, spawning one if needed.
    ///
    /// Concurrent first arrivals converge on a single session: the slow path
    /// re-checks under the write lock before spawning. A session that is
    /// shutting down stays in the map until it has retired, and no
    /// replacement is spawned before then, so at most one lane per context
    /// ever runs.
    async fn session(&self, context_id: &EditingContextId) -> SessionHandle {
        loop {
            // Fast path: check cache with read lock.
            {
                let sessions = self.sessions.read().await;
                if let Some(session) = sessions.get(context_id)
                    && session.is_alive()
                {
                    return session.clone();
                }
            }

            // Slow path: wait out a retiring session, or spawn a new one.
            let stale = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(context_id) {
                    Some(session) if session.is_alive() => return session.clone(),
                    Some(session) if session.state() != SessionState::Retired => session.clone(),
                    _ => {
                        sessions.retain(|_, session| session.state() != SessionState::Retired);
                        let session = self.factory.spawn(context_id.clone());
                        sessions.insert(context_id.clone(), session.clone());
                        return session;
                    }
                }
            };

            tracing::debug!(context_id = %context_id, "waiting for previous session to retire");
            stale.retired().await;
        }
    }
}

/// Builder for [`Dispatcher`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sirius_dispatch::{ContextError, Dispatcher, EditingContextId, MaxQueueDepth};
///
/// let dispatcher = Dispatcher::<()>::builder(|_id: &EditingContextId| Ok::<_, ContextError>(Arc::new(())))
///     .idle_timeout(Some(Duration::from_secs(60)))
///     .subscriber_capacity(64)
///     .admission_policy(MaxQueueDepth(100))
///     .build();
/// ```
pub struct DispatcherBuilder<C> {
    registry: HandlerRegistry<C>,
    loader: Arc<dyn EditingContextLoader<C>>,
    config: SessionConfig,
    admission: Arc<dyn AdmissionPolicy>,
    lifecycle: Arc<dyn SessionLifecycle>,
}

impl<C> DispatcherBuilder<C>
where
    C: Send + Sync + 'static,
{
    /// Create a builder with no handlers and default session tuning.
    ///
    /// # Arguments
    ///
    /// * `loader` - Resolves editing contexts when their session starts.
    pub fn new<L>(loader: L) -> Self
    where
        L: EditingContextLoader<C>,
    {
        Self {
            registry: HandlerRegistry::new(),
            loader: Arc::new(loader),
            config: SessionConfig::default(),
            admission: Arc::new(Unbounded),
            lifecycle: Arc::new(NoopLifecycle),
        }
    }

    /// Register a handler behind an explicit routing predicate.
    ///
    /// Registration order matters: when several predicates accept a command,
    /// the handler registered first wins.
    pub fn register<P, H>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&C, &Command) -> bool + Send + Sync + 'static,
        H: Handler<C>,
    {
        self.registry.register(predicate, handler);
        self
    }

    /// Register a handler that routes on its own
    /// [`Handler::can_handle`].
    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: Handler<C>,
    {
        self.registry.register_handler(handler);
        self
    }

    /// Set how long an unobserved idle session lives before retiring.
    ///
    /// `None` keeps sessions alive until shut down. Defaults to 5 minutes.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set how many events a subscriber may fall behind before it is
    /// disconnected. Defaults to 256.
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_capacity = capacity;
        self
    }

    /// Set the policy that bounds each session's queue. Defaults to
    /// [`Unbounded`].
    pub fn admission_policy<P>(mut self, policy: P) -> Self
    where
        P: AdmissionPolicy,
    {
        self.admission = Arc::new(policy);
        self
    }

    /// Set the listener notified when sessions are created and retired.
    pub fn lifecycle_listener<L>(mut self, listener: L) -> Self
    where
        L: SessionLifecycle,
    {
        self.lifecycle = Arc::new(listener);
        self
    }

    /// Freeze the registry and build the dispatcher.
    ///
    /// No session is spawned until the first command or subscription.
    pub fn build(self) -> Dispatcher<C> {
        tracing::debug!(
            handlers = self.registry.len(),
            idle_timeout = ?self.config.idle_timeout,
            "building dispatcher"
        );
        Dispatcher {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            factory: Arc::new(SessionFactory {
                registry: Arc::new(self.registry),
                loader: self.loader,
                config: self.config,
                lifecycle: self.lifecycle,
            }),
            admission: self.admission,
        }
    }
}
