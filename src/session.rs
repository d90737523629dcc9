//! Per-editing-context session: the serialized execution lane.
//!
//! Each live session is one tokio task fed by an unbounded FIFO queue of
//! [`SessionMessage`]s. The task exclusively drives the handlers of its
//! editing context, so at most one command mutates a given model at any
//! time, and commands start in the order they were queued. It also owns the
//! context's subscribers and stamps the change events it broadcasts to them.
//!
//! Lifecycle: `Created` (loading the context) → `Idle` ⇄ `Executing` →
//! `Retiring` → `Retired`. A retired session is never revived; the
//! dispatcher spawns a fresh one for the next command or subscriber.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::admission::QueueDepth;
use crate::command::{Command, CommandResult, EditingContextId};
use crate::context::EditingContextLoader;
use crate::error::{ErrorKind, Failure, SubscribeError};
use crate::event::{ChangeEvent, EventStamper};
use crate::registry::HandlerRegistry;
use crate::subscription::{DEFAULT_SUBSCRIBER_CAPACITY, SubscriberId, Subscribers, Subscription};

/// Default idle timeout before an unobserved session retires: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Spawned; resolving the editing context.
    Created,
    /// Ready; no command running.
    Idle,
    /// Exactly one command running; later commands wait in the queue.
    Executing,
    /// No longer accepting messages; finishing what was already queued.
    Retiring,
    /// Terminal. The session task has exited.
    Retired,
}

/// Per-session tuning.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sirius_dispatch::SessionConfig;
///
/// let config = SessionConfig {
///     idle_timeout: Some(Duration::from_secs(30)),
///     ..SessionConfig::default()
/// };
/// assert_eq!(config.subscriber_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session without subscribers may sit idle before it
    /// retires. `None` keeps sessions alive until shut down explicitly.
    ///
    /// Default: 5 minutes.
    pub idle_timeout: Option<Duration>,

    /// How many undelivered events each subscriber may accumulate before it
    /// is disconnected.
    ///
    /// Default: 256.
    pub subscriber_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Hooks fired when sessions start and stop.
///
/// The session core does not decide how long contexts stay resident beyond
/// its idle timeout; a retention collaborator observes sessions through
/// these hooks. Both run on the runtime's worker threads and must not block.
pub trait SessionLifecycle: Send + Sync + 'static {
    /// A fresh session was spawned for `context_id`.
    fn on_created(&self, context_id: &EditingContextId) {
        let _ = context_id;
    }

    /// The session for `context_id` retired.
    fn on_retired(&self, context_id: &EditingContextId) {
        let _ = context_id;
    }
}

/// Lifecycle listener that ignores every hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl SessionLifecycle for NoopLifecycle {}

/// Messages sent from the dispatcher to a session lane.
///
/// Each request variant carries a `oneshot::Sender` for the lane to reply
/// on.
#[derive(Debug)]
pub(crate) enum SessionMessage {
    /// Run a command.
    Execute {
        command: Command,
        reply: oneshot::Sender<CommandResult>,
    },

    /// Attach a subscriber at the current position in the event order.
    Subscribe {
        reply: oneshot::Sender<Result<Subscription, SubscribeError>>,
    },

    /// Detach a subscriber.
    Unsubscribe { id: SubscriberId },
}

/// Dispatcher-side handle to a running session.
///
/// Shutdown travels beside the queue, not through it, so commands already
/// queued when it is requested are cancelled rather than run.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) sender: mpsc::UnboundedSender<SessionMessage>,
    pub(crate) depth: QueueDepth,
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Whether the session still takes new work: its queue is open and no
    /// shutdown was requested.
    ///
    /// A session that is not alive may still be finishing a command; see
    /// [`retired`](Self::retired).
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed() && !*self.shutdown.borrow()
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Ask the lane to stop once its running command, if any, is done.
    ///
    /// # Returns
    ///
    /// `true` if this call made the request, `false` if it was already made.
    pub(crate) fn request_shutdown(&self) -> bool {
        self.shutdown
            .send_if_modified(|requested| !std::mem::replace(requested, true))
    }

    /// Wait until the session has retired.
    pub(crate) async fn retired(&self) {
        let mut state = self.state.clone();
        // An error means the sender is gone, which only happens after the
        // task has published `Retired` and exited.
        let _ = state.wait_for(|s| *s == SessionState::Retired).await;
    }
}

/// Everything needed to spawn sessions, shared by all of them.
pub(crate) struct SessionFactory<C> {
    pub(crate) registry: Arc<HandlerRegistry<C>>,
    pub(crate) loader: Arc<dyn EditingContextLoader<C>>,
    pub(crate) config: SessionConfig,
    pub(crate) lifecycle: Arc<dyn SessionLifecycle>,
}

impl<C> SessionFactory<C>
where
    C: Send + Sync + 'static,
{
    /// Spawn the session task for `context_id` and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(&self, context_id: EditingContextId) -> SessionHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let depth = QueueDepth::default();

        tracing::debug!(context_id = %context_id, "spawning session");
        self.lifecycle.on_created(&context_id);

        let lane = Lane {
            subscribers: Subscribers::new(context_id.clone(), self.config.subscriber_capacity),
            stamper: EventStamper::new(context_id.clone()),
            context_id,
            registry: Arc::clone(&self.registry),
            loader: Arc::clone(&self.loader),
            idle_timeout: self.config.idle_timeout,
            lifecycle: Arc::clone(&self.lifecycle),
            state: state_tx,
            shutdown: shutdown_rx,
            depth: depth.clone(),
        };
        tokio::spawn(lane.run(receiver));

        SessionHandle {
            sender,
            depth,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
        }
    }
}

/// Why the main loop stopped.
enum Exit {
    /// Idle with nobody watching.
    Idle,
    /// Explicit shutdown request.
    Shutdown,
    /// Every sender is gone.
    Disconnected,
}

/// What the lane woke up for.
enum Next {
    Message(Option<SessionMessage>),
    IdleTimeout,
}

/// Wait for the next queued message, or for the idle timeout to elapse.
async fn next_message(rx: &mut mpsc::UnboundedReceiver<SessionMessage>, idle_timeout: Option<Duration>) -> Next {
    match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(message) => Next::Message(message),
            Err(_elapsed) => Next::IdleTimeout,
        },
        None => Next::Message(rx.recv().await),
    }
}

/// State owned by one session task.
struct Lane<C> {
    context_id: EditingContextId,
    registry: Arc<HandlerRegistry<C>>,
    loader: Arc<dyn EditingContextLoader<C>>,
    idle_timeout: Option<Duration>,
    lifecycle: Arc<dyn SessionLifecycle>,
    state: watch::Sender<SessionState>,
    shutdown: watch::Receiver<bool>,
    depth: QueueDepth,
    subscribers: Subscribers,
    stamper: EventStamper,
}

impl<C> Lane<C>
where
    C: Send + Sync + 'static,
{
    /// Run the session until it retires.
    ///
    /// Loads the context, then processes messages one at a time. On exit the
    /// queue is closed and whatever was already accepted is settled: drained
    /// commands still run after an idle retirement, and are cancelled once a
    /// shutdown was requested or the load failed. Nothing accepted is left
    /// unanswered.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        let context = match self.loader.load(&self.context_id).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(context_id = %self.context_id, error = %e, "editing context unavailable");
                let failure = Failure::context_unavailable(&self.context_id, &e);
                self.set_state(SessionState::Retiring);
                rx.close();
                while let Some(message) = rx.recv().await {
                    self.refuse(message, &failure);
                }
                self.finish();
                return;
            }
        };

        self.set_state(SessionState::Idle);
        match self.serve(&context, &mut rx).await {
            Exit::Idle => tracing::info!(context_id = %self.context_id, "session idle, retiring"),
            Exit::Shutdown => tracing::info!(context_id = %self.context_id, "session shut down"),
            Exit::Disconnected => {
                tracing::debug!(context_id = %self.context_id, "dispatcher gone, retiring");
            }
        }

        self.set_state(SessionState::Retiring);
        rx.close();
        let cancelled = Failure::new(
            ErrorKind::Cancelled,
            format!(
                "editing context '{}' shut down before the command started",
                self.context_id
            ),
        );
        while let Some(message) = rx.recv().await {
            match message {
                SessionMessage::Execute { command, reply } if !self.shutdown_requested() => {
                    self.execute(&context, command, reply).await;
                }
                other => self.refuse(other, &cancelled),
            }
        }
        self.finish();
    }

    /// Main loop: one message at a time until an exit condition.
    ///
    /// The shutdown flag is checked before every message, so a request made
    /// while a command runs takes effect as soon as that command is settled.
    async fn serve(&mut self, context: &C, rx: &mut mpsc::UnboundedReceiver<SessionMessage>) -> Exit {
        loop {
            if self.shutdown_requested() {
                return Exit::Shutdown;
            }

            let idle_timeout = self.idle_timeout;
            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => return Exit::Disconnected,
                },
                next = next_message(rx, idle_timeout) => next,
            };

            match next {
                Next::IdleTimeout => {
                    self.subscribers.prune_closed();
                    if self.subscribers.is_empty() && self.depth.current() == 0 {
                        return Exit::Idle;
                    }
                }
                Next::Message(Some(SessionMessage::Execute { command, reply })) => {
                    self.execute(context, command, reply).await;
                }
                Next::Message(Some(SessionMessage::Subscribe { reply })) => {
                    let _ = reply.send(Ok(self.subscribers.attach()));
                }
                Next::Message(Some(SessionMessage::Unsubscribe { id })) => {
                    self.subscribers.detach(id);
                }
                Next::Message(None) => return Exit::Disconnected,
            }
        }
    }

    /// Run one command and settle it: answer the caller, broadcast changes.
    async fn execute(&mut self, context: &C, command: Command, reply: oneshot::Sender<CommandResult>) {
        // The caller stopped waiting before the command started: drop it.
        if reply.is_closed() {
            tracing::debug!(
                context_id = %self.context_id,
                correlation_id = %command.id(),
                "caller gone before start, skipping command"
            );
            self.depth.release();
            return;
        }

        let resting = self.state.send_replace(SessionState::Executing);
        let span = tracing::info_span!(
            "execute",
            context_id = %self.context_id,
            correlation_id = %command.id(),
            kind = command.kind(),
        );
        let (result, events) = self.handle(context, &command).instrument(span).await;

        self.subscribers.broadcast(&events);
        // A caller that gave up mid-execution no longer wants the result.
        let _ = reply.send(result);
        self.depth.release();
        self.set_state(resting);
    }

    /// Select and invoke the handler, converting every fault into a failure.
    async fn handle(&mut self, context: &C, command: &Command) -> (CommandResult, Vec<ChangeEvent>) {
        let correlation_id = command.id().clone();

        let routed = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry
                .select(context, command)
                .filter(|handler| handler.can_handle(context, command))
        }));
        let handler = match routed {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                tracing::debug!("no handler accepts the command");
                let failure = Failure::unsupported_input(command.kind());
                return (CommandResult::failure(correlation_id, failure), Vec::new());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "handler routing panicked");
                let failure = Failure::internal(format!("handler routing panicked: {message}"));
                return (CommandResult::failure(correlation_id, failure), Vec::new());
            }
        };

        match AssertUnwindSafe(handler.handle(context, command)).catch_unwind().await {
            Ok(Ok(handled)) => {
                let events = self.stamper.stamp(&correlation_id, handled.changes);
                tracing::debug!(events = events.len(), "command handled");
                let result = CommandResult {
                    correlation_id,
                    outcome: handled.outcome,
                };
                (result, events)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "handler failed");
                (CommandResult::failure(correlation_id, Failure::internal(e.to_string())), Vec::new())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "handler panicked");
                let failure = Failure::internal(format!("handler panicked: {message}"));
                (CommandResult::failure(correlation_id, failure), Vec::new())
            }
        }
    }

    /// Answer a message without processing it.
    fn refuse(&self, message: SessionMessage, failure: &Failure) {
        match message {
            SessionMessage::Execute { command, reply } => {
                let _ = reply.send(CommandResult::failure(command.id().clone(), failure.clone()));
                self.depth.release();
            }
            SessionMessage::Subscribe { reply } => {
                let error = if failure.kind == ErrorKind::ContextUnavailable {
                    SubscribeError::ContextUnavailable(failure.clone())
                } else {
                    SubscribeError::SessionGone
                };
                let _ = reply.send(Err(error));
            }
            SessionMessage::Unsubscribe { .. } => {}
        }
    }

    /// End every subscription, publish `Retired`, fire the hook.
    fn finish(&mut self) {
        tracing::debug!(
            context_id = %self.context_id,
            subscribers = self.subscribers.len(),
            "ending subscriptions"
        );
        self.subscribers.close_all();
        self.set_state(SessionState::Retired);
        self.lifecycle.on_retired(&self.context_id);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::command::{Input, Outcome};
    use crate::error::{ContextError, HandlerError};
    use crate::event::ChangeKind;
    use crate::handler::test_fixtures::{AppendHandler, EchoHandler, Notebook, PanicHandler};
    use crate::handler::{Handled, Handler};

    /// Sleeps inside the lane and records overlap and start order.
    #[derive(Default)]
    struct SlowRecorder {
        running: AtomicBool,
        overlapped: AtomicBool,
        order: Mutex<Vec<String>>,
    }

    struct SlowHandler(Arc<SlowRecorder>);

    #[async_trait::async_trait]
    impl Handler<Notebook> for SlowHandler {
        fn can_handle(&self, _context: &Notebook, command: &Command) -> bool {
            command.kind() == "slow"
        }

        async fn handle(&self, _context: &Notebook, command: &Command) -> Result<Handled, HandlerError> {
            if self.0.running.swap(true, Ordering::SeqCst) {
                self.0.overlapped.store(true, Ordering::SeqCst);
            }
            self.0
                .order
                .lock()
                .map_err(|_| HandlerError::other("poisoned"))?
                .push(command.id().to_string());
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.running.store(false, Ordering::SeqCst);
            Ok(Handled::success(json!(null)).with_change(ChangeKind::SEMANTIC_CHANGE))
        }
    }

    /// Counts retirements.
    #[derive(Default)]
    struct CountingLifecycle {
        created: AtomicUsize,
        retired: AtomicUsize,
    }

    impl SessionLifecycle for CountingLifecycle {
        fn on_created(&self, _context_id: &EditingContextId) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn on_retired(&self, _context_id: &EditingContextId) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry(recorder: Arc<SlowRecorder>) -> HandlerRegistry<Notebook> {
        let mut registry = HandlerRegistry::new();
        registry.register_handler(EchoHandler);
        registry.register_handler(AppendHandler);
        registry.register_handler(PanicHandler);
        registry.register_handler(SlowHandler(recorder));
        registry
    }

    fn factory(
        recorder: Arc<SlowRecorder>,
        config: SessionConfig,
        lifecycle: Arc<dyn SessionLifecycle>,
    ) -> SessionFactory<Notebook> {
        let notebook = Arc::new(Notebook::default());
        SessionFactory {
            registry: Arc::new(registry(recorder)),
            loader: Arc::new(move |_id: &EditingContextId| Ok::<_, ContextError>(Arc::clone(&notebook))),
            config,
            lifecycle,
        }
    }

    fn spawn_default() -> (SessionHandle, Arc<SlowRecorder>) {
        let recorder = Arc::new(SlowRecorder::default());
        let factory = factory(
            Arc::clone(&recorder),
            SessionConfig::default(),
            Arc::new(NoopLifecycle),
        );
        (factory.spawn(EditingContextId::new("ctx-1")), recorder)
    }

    fn send(handle: &SessionHandle, id: &str, kind: &str, data: serde_json::Value) -> oneshot::Receiver<CommandResult> {
        let (reply, rx) = oneshot::channel();
        handle.depth.try_reserve(&crate::admission::Unbounded, &EditingContextId::new("ctx-1")).expect("reserve");
        handle
            .sender
            .send(SessionMessage::Execute {
                command: Command::new(id, Input::new(kind, data)),
                reply,
            })
            .expect("session should accept messages");
        rx
    }

    async fn subscribe(handle: &SessionHandle) -> Subscription {
        let (reply, rx) = oneshot::channel();
        handle
            .sender
            .send(SessionMessage::Subscribe { reply })
            .expect("session should accept messages");
        rx.await
            .expect("session should reply")
            .expect("subscribe should succeed")
    }

    #[tokio::test]
    async fn echo_answers_caller_and_notifies_subscriber() {
        let (handle, _) = spawn_default();
        let mut sub = subscribe(&handle).await;

        let result = send(&handle, "c1", "echo", json!("hello"))
            .await
            .expect("reply should arrive");
        assert_eq!(result.correlation_id.as_str(), "c1");
        assert_eq!(result.outcome, Outcome::Success(json!("hello")));

        let event = sub
            .recv()
            .await
            .expect("an event should arrive")
            .expect("event should not be a failure");
        assert_eq!(event.cause.as_str(), "c1");
        assert_eq!(event.kind.as_str(), "echoed");
        assert_eq!(event.sequence, 1);
        assert!(sub.try_recv().is_none(), "exactly one event expected");
    }

    #[tokio::test]
    async fn commands_never_overlap_and_start_in_queue_order() {
        let (handle, recorder) = spawn_default();

        let replies: Vec<_> = (0..5)
            .map(|i| send(&handle, &format!("c{i}"), "slow", json!(null)))
            .collect();
        for reply in replies {
            reply.await.expect("reply should arrive");
        }

        assert!(!recorder.overlapped.load(Ordering::SeqCst), "handlers overlapped");
        let order = recorder.order.lock().expect("lock").clone();
        assert_eq!(order, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn unmatched_command_fails_with_unsupported_input() {
        let (handle, _) = spawn_default();
        let mut sub = subscribe(&handle).await;

        let result = send(&handle, "c1", "nobody-handles-this", json!(null))
            .await
            .expect("reply should arrive");
        assert_eq!(result.error_kind(), Some(ErrorKind::UnsupportedInput));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn panicking_handler_fails_command_and_lane_survives() {
        let (handle, _) = spawn_default();
        let mut sub = subscribe(&handle).await;

        let result = send(&handle, "boom", "panic", json!(null))
            .await
            .expect("reply should arrive");
        assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
        assert!(
            matches!(&result.outcome, Outcome::Failure(f) if f.message.contains("handler blew up")),
            "unexpected outcome: {result:?}"
        );

        let next = send(&handle, "c2", "append", json!("line"))
            .await
            .expect("reply should arrive");
        assert_eq!(next.outcome, Outcome::Success(json!(1)));

        let event = sub.recv().await.expect("event").expect("not a failure");
        assert_eq!(event.cause.as_str(), "c2", "the panicking command emits nothing");
    }

    #[tokio::test]
    async fn handler_error_becomes_internal_error_without_events() {
        let (handle, _) = spawn_default();
        let mut sub = subscribe(&handle).await;

        // `echo` decodes a string; a number makes the fixture return `Err`.
        let result = send(&handle, "c1", "echo", json!(7)).await.expect("reply");
        assert_eq!(result.error_kind(), Some(ErrorKind::InternalError));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn abandoned_command_is_skipped_before_start() {
        let (handle, recorder) = spawn_default();

        let first = send(&handle, "c1", "slow", json!(null));
        let abandoned = send(&handle, "c2", "slow", json!(null));
        drop(abandoned);
        first.await.expect("reply");

        // Flush the lane with one more command.
        send(&handle, "c3", "slow", json!(null)).await.expect("reply");
        let order = recorder.order.lock().expect("lock").clone();
        assert_eq!(order, vec!["c1", "c3"]);
        assert_eq!(handle.depth.current(), 0);
    }

    #[tokio::test]
    async fn subscriber_attached_mid_stream_sees_only_later_events() {
        let (handle, _) = spawn_default();
        let mut early = subscribe(&handle).await;

        send(&handle, "c1", "append", json!("a")).await.expect("reply");
        let mut late = subscribe(&handle).await;
        send(&handle, "c2", "append", json!("b")).await.expect("reply");
        send(&handle, "c3", "append", json!("c")).await.expect("reply");

        let mut causes = Vec::new();
        while let Some(Ok(e)) = early.try_recv() {
            causes.push(e.cause.to_string());
        }
        assert_eq!(causes, vec!["c1", "c2", "c3"]);

        let mut late_causes = Vec::new();
        while let Some(Ok(e)) = late.try_recv() {
            late_causes.push(e.cause.to_string());
        }
        assert_eq!(late_causes, vec!["c2", "c3"]);
    }

    #[tokio::test]
    async fn state_moves_through_executing_back_to_idle() {
        let (handle, _) = spawn_default();
        send(&handle, "c1", "echo", json!("x")).await.expect("reply");
        assert_eq!(handle.state(), SessionState::Idle);
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        while handle.state() != state {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_commands_queued_before_the_request() {
        let lifecycle = Arc::new(CountingLifecycle::default());
        let recorder = Arc::new(SlowRecorder::default());
        let factory = factory(Arc::clone(&recorder), SessionConfig::default(), lifecycle.clone());
        let handle = factory.spawn(EditingContextId::new("ctx-1"));
        let mut sub = subscribe(&handle).await;

        let running = send(&handle, "c1", "slow", json!(null));
        let queued = send(&handle, "c2", "slow", json!(null));
        wait_for_state(&handle, SessionState::Executing).await;

        assert!(handle.request_shutdown(), "first request should take effect");
        assert!(!handle.request_shutdown(), "second request is a no-op");
        assert!(!handle.is_alive(), "no new work once shutdown is requested");
        assert_eq!(handle.state(), SessionState::Executing, "running command is not aborted");

        let running = running.await.expect("running command should finish");
        assert!(running.outcome.is_success());
        let queued = queued.await.expect("queued command should be answered");
        assert_eq!(queued.error_kind(), Some(ErrorKind::Cancelled));

        handle.retired().await;
        assert_eq!(handle.state(), SessionState::Retired);
        assert_eq!(recorder.order.lock().expect("lock").clone(), vec!["c1"]);
        assert_eq!(handle.depth.current(), 0);
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.retired.load(Ordering::SeqCst), 1);

        // The event from c1 is still delivered, then the stream ends.
        assert!(matches!(sub.recv().await, Some(Ok(_))));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_of_idle_session_retires_promptly() {
        let (handle, _) = spawn_default();
        let _sub = subscribe(&handle).await;

        handle.request_shutdown();
        handle.retired().await;
        assert!(!handle.is_alive());
        assert!(handle.sender.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_without_subscribers_retires() {
        let lifecycle = Arc::new(CountingLifecycle::default());
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..SessionConfig::default()
        };
        let factory = factory(Arc::new(SlowRecorder::default()), config, lifecycle.clone());
        let handle = factory.spawn(EditingContextId::new("ctx-1"));

        send(&handle, "c1", "echo", json!("x")).await.expect("reply");
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.retired().await;

        assert!(!handle.is_alive(), "session should retire after idling");
        assert_eq!(lifecycle.retired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_with_subscriber_stays_alive() {
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..SessionConfig::default()
        };
        let factory = factory(Arc::new(SlowRecorder::default()), config, Arc::new(NoopLifecycle));
        let handle = factory.spawn(EditingContextId::new("ctx-1"));
        let sub = subscribe(&handle).await;

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(handle.is_alive(), "an observed session must not retire");

        drop(sub);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        handle.retired().await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn failed_load_answers_context_unavailable_and_retires() {
        let factory = SessionFactory::<Notebook> {
            registry: Arc::new(HandlerRegistry::new()),
            loader: Arc::new(|id: &EditingContextId| {
                Err::<Arc<Notebook>, _>(ContextError::NotFound(id.clone()))
            }),
            config: SessionConfig::default(),
            lifecycle: Arc::new(NoopLifecycle),
        };
        let handle = factory.spawn(EditingContextId::new("missing"));

        let (reply, rx) = oneshot::channel();
        handle
            .sender
            .send(SessionMessage::Subscribe { reply })
            .expect("send subscribe");
        let result = send(&handle, "c1", "echo", json!("x")).await.expect("reply");

        assert_eq!(result.error_kind(), Some(ErrorKind::ContextUnavailable));
        assert!(matches!(
            rx.await.expect("reply"),
            Err(SubscribeError::ContextUnavailable(_))
        ));
        handle.retired().await;
        assert_eq!(handle.state(), SessionState::Retired);
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let from_str: Box<dyn std::any::Any + Send> = Box::new("static");
        let from_string: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn std::any::Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(from_str.as_ref()), "static");
        assert_eq!(panic_message(from_string.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
