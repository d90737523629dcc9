//! Admission control for session queues.
//!
//! Session queues are unbounded by default. A policy may cap how many
//! commands can be queued (or running) on one editing context; commands past
//! the cap are rejected with [`ErrorKind::Overloaded`](crate::ErrorKind::Overloaded)
//! and never enqueued.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::command::EditingContextId;

/// Decides whether a new command may join a session's queue.
pub trait AdmissionPolicy: Send + Sync + 'static {
    /// Whether to admit a command given the current depth of the queue.
    ///
    /// # Arguments
    ///
    /// * `context_id` - The editing context the command targets.
    /// * `queued` - Commands currently queued or running on that context.
    fn admit(&self, context_id: &EditingContextId, queued: usize) -> bool;
}

/// Admits every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl AdmissionPolicy for Unbounded {
    fn admit(&self, _context_id: &EditingContextId, _queued: usize) -> bool {
        true
    }
}

/// Rejects commands once the given number of commands are queued or running
/// on a context.
#[derive(Debug, Clone, Copy)]
pub struct MaxQueueDepth(pub usize);

impl AdmissionPolicy for MaxQueueDepth {
    fn admit(&self, _context_id: &EditingContextId, queued: usize) -> bool {
        queued < self.0
    }
}

/// Lock-free count of commands admitted into one session and not yet
/// answered.
///
/// Shared by the dispatcher, which reserves a slot before enqueueing, and
/// the session lane, which releases it once the command is answered.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueueDepth {
    pending: Arc<AtomicUsize>,
}

impl QueueDepth {
    /// Current depth.
    pub(crate) fn current(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserve a slot if `policy` admits one more command.
    ///
    /// # Returns
    ///
    /// `Err(depth)` with the depth observed at rejection time.
    pub(crate) fn try_reserve(
        &self,
        policy: &dyn AdmissionPolicy,
        context_id: &EditingContextId,
    ) -> Result<(), usize> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if !policy.admit(context_id, current) {
                return Err(current);
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one slot.
    pub(crate) fn release(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
