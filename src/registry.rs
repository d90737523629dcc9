//! Handler registry: ordered `(predicate, handler)` pairs.
//!
//! The registry is filled while the dispatcher is being built and is frozen
//! behind an `Arc` afterwards, so selection takes no lock.
//!
//! When several predicates accept the same command, the handler registered
//! **first** wins. Handler sets are open, so this rule is part of the
//! registry's contract rather than an accident of iteration order.

use std::sync::Arc;

use crate::command::Command;
use crate::handler::Handler;

/// Routing predicate evaluated against the context and the command.
pub type Predicate<C> = Box<dyn Fn(&C, &Command) -> bool + Send + Sync>;

/// One registered handler and the predicate that routes to it.
struct Registration<C> {
    predicate: Predicate<C>,
    handler: Arc<dyn Handler<C>>,
}

/// Ordered table of handlers, consulted once per command.
pub struct HandlerRegistry<C> {
    registrations: Vec<Registration<C>>,
}

impl<C> HandlerRegistry<C>
where
    C: Send + Sync + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Register `handler` behind an explicit routing predicate.
    ///
    /// # Arguments
    ///
    /// * `predicate` - Decides whether `handler` should receive a command.
    /// * `handler` - The handler to route to.
    pub fn register<P, H>(&mut self, predicate: P, handler: H)
    where
        P: Fn(&C, &Command) -> bool + Send + Sync + 'static,
        H: Handler<C>,
    {
        self.registrations.push(Registration {
            predicate: Box::new(predicate),
            handler: Arc::new(handler),
        });
    }

    /// Register `handler`, routing on its own [`Handler::can_handle`].
    pub fn register_handler<H>(&mut self, handler: H)
    where
        H: Handler<C>,
    {
        let handler: Arc<dyn Handler<C>> = Arc::new(handler);
        let router = Arc::clone(&handler);
        self.registrations.push(Registration {
            predicate: Box::new(move |context, command| router.can_handle(context, command)),
            handler,
        });
    }

    /// Pick the handler for `command`.
    ///
    /// Predicates are evaluated in registration order; the first match wins.
    ///
    /// # Returns
    ///
    /// The selected handler, or `None` if no predicate accepts the command.
    pub fn select(&self, context: &C, command: &Command) -> Option<Arc<dyn Handler<C>>> {
        self.registrations
            .iter()
            .find(|registration| (registration.predicate)(context, command))
            .map(|registration| Arc::clone(&registration.handler))
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl<C> Default for HandlerRegistry<C>
where
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}
