//! Command dispatch and change notification for shared editing contexts.
//!
//! Every editing context gets a session: a serialized lane that runs the
//! context's commands one at a time, in arrival order, and fans the
//! resulting change events out to the context's subscribers.

mod admission;
mod command;
mod context;
mod dispatcher;
mod error;
mod event;
mod handler;
mod registry;
mod session;
mod subscription;

pub use admission::{AdmissionPolicy, MaxQueueDepth, Unbounded};
pub use command::{Command, CommandResult, CorrelationId, EditingContextId, Input, Outcome};
pub use context::EditingContextLoader;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{ContextError, ErrorKind, Failure, HandlerError, SubscribeError};
pub use event::{ChangeEvent, ChangeKind};
pub use handler::{BoxFuture, FnHandler, Handled, Handler};
pub use registry::{HandlerRegistry, Predicate};
pub use session::{DEFAULT_IDLE_TIMEOUT, NoopLifecycle, SessionConfig, SessionLifecycle, SessionState};
pub use subscription::{DEFAULT_SUBSCRIBER_CAPACITY, SubscriberId, Subscription};
