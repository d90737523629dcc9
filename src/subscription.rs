//! Subscriber fan-out: per-subscriber bounded buffers fed by the session.
//!
//! The session pushes every change event into each subscriber's buffer with
//! a non-blocking `try_send`. A subscriber whose buffer is full is cut off
//! on the spot, so a slow client never stalls the mutation lane. It still
//! drains what was buffered before the cut-off, in order, then observes a
//! single [`ErrorKind::SubscriberOverrun`](crate::ErrorKind::SubscriberOverrun)
//! failure and the end of the stream.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::Stream;

use crate::command::EditingContextId;
use crate::error::Failure;
use crate::event::ChangeEvent;

/// Default number of undelivered events a subscriber may accumulate.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Source of process-wide unique subscriber ids. Ids stay unique across
/// session restarts so a stale handle can never detach a newer subscriber.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one attached subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A client-held cursor into one editing context's change events.
///
/// Receives every event produced after it was attached, in production order.
/// Events produced before attachment are never replayed.
///
/// Dropping the subscription detaches it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    context_id: EditingContextId,
    capacity: usize,
    receiver: mpsc::Receiver<ChangeEvent>,
    overrun: Arc<AtomicBool>,
    overrun_reported: bool,
}

impl Subscription {
    /// Identifier of this subscriber.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The editing context this subscription observes.
    pub fn context_id(&self) -> &EditingContextId {
        &self.context_id
    }

    /// Wait for the next change event.
    ///
    /// # Returns
    ///
    /// * `Some(Ok(event))` - the next event.
    /// * `Some(Err(failure))` - the subscriber was disconnected for falling
    ///   behind. Returned once, after the buffered events.
    /// * `None` - the subscription ended (detached, or the session retired).
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, Failure>> {
        match self.receiver.recv().await {
            Some(event) => Some(Ok(event)),
            None => self.take_overrun().map(Err),
        }
    }

    /// Take the next event if one is already buffered.
    ///
    /// Returns `None` when the buffer is empty, without waiting.
    pub fn try_recv(&mut self) -> Option<Result<ChangeEvent, Failure>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.take_overrun().map(Err),
        }
    }

    /// Whether the session cut this subscriber off for falling behind.
    pub fn is_overrun(&self) -> bool {
        self.overrun.load(Ordering::Acquire)
    }

    fn take_overrun(&mut self) -> Option<Failure> {
        if self.overrun_reported || !self.overrun.load(Ordering::Acquire) {
            return None;
        }
        self.overrun_reported = true;
        Some(Failure::subscriber_overrun(self.capacity))
    }
}

impl Stream for Subscription {
    type Item = Result<ChangeEvent, Failure>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => Poll::Ready(this.take_overrun().map(Err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Session-side end of one subscription.
#[derive(Debug)]
struct SubscriberSlot {
    id: SubscriberId,
    sender: mpsc::Sender<ChangeEvent>,
    overrun: Arc<AtomicBool>,
}

/// The set of subscribers attached to one session.
///
/// Owned by the session lane; every mutation happens between two commands,
/// which is what gives attachment a well-defined position in the event
/// order.
#[derive(Debug)]
pub(crate) struct Subscribers {
    context_id: EditingContextId,
    capacity: usize,
    slots: Vec<SubscriberSlot>,
}

impl Subscribers {
    pub(crate) fn new(context_id: EditingContextId, capacity: usize) -> Self {
        Self {
            context_id,
            capacity: capacity.max(1),
            slots: Vec::new(),
        }
    }

    /// Attach a new subscriber and hand back its client end.
    pub(crate) fn attach(&mut self) -> Subscription {
        let id = SubscriberId::next();
        let (sender, receiver) = mpsc::channel(self.capacity);
        let overrun = Arc::new(AtomicBool::new(false));
        self.slots.push(SubscriberSlot {
            id,
            sender,
            overrun: Arc::clone(&overrun),
        });
        tracing::debug!(context_id = %self.context_id, subscriber = %id, "subscriber attached");
        Subscription {
            id,
            context_id: self.context_id.clone(),
            capacity: self.capacity,
            receiver,
            overrun,
            overrun_reported: false,
        }
    }

    /// Detach a subscriber. Returns `false` if it was not attached.
    pub(crate) fn detach(&mut self, id: SubscriberId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);
        let removed = self.slots.len() != before;
        if removed {
            tracing::debug!(context_id = %self.context_id, subscriber = %id, "subscriber detached");
        }
        removed
    }

    /// Push `events`, in order, to every attached subscriber.
    ///
    /// Never waits. Subscribers with a full buffer are disconnected; those
    /// whose client end was dropped are removed.
    pub(crate) fn broadcast(&mut self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let context_id = &self.context_id;
        let capacity = self.capacity;
        self.slots.retain(|slot| {
            for event in events {
                match slot.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        slot.overrun.store(true, Ordering::Release);
                        tracing::warn!(
                            context_id = %context_id,
                            subscriber = %slot.id,
                            capacity,
                            "subscriber overrun, disconnecting"
                        );
                        return false;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    /// Drop subscribers whose client end is gone.
    pub(crate) fn prune_closed(&mut self) {
        self.slots.retain(|slot| !slot.sender.is_closed());
    }

    /// Number of attached subscribers.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no subscriber is attached.
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Detach everyone; their streams end after the buffered events.
    pub(crate) fn close_all(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::command::CorrelationId;
    use crate::error::ErrorKind;
    use crate::event::ChangeKind;

    fn event(sequence: u64) -> ChangeEvent {
        ChangeEvent {
            context_id: EditingContextId::new("ctx-1"),
            cause: CorrelationId::new(format!("c{sequence}")),
            kind: ChangeKind::semantic_change(),
            sequence,
            emitted_at: 0,
        }
    }

    fn subscribers(capacity: usize) -> Subscribers {
        Subscribers::new(EditingContextId::new("ctx-1"), capacity)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_in_order() {
        let mut subs = subscribers(8);
        let mut a = subs.attach();
        let mut b = subs.attach();

        subs.broadcast(&[event(1), event(2)]);
        subs.broadcast(&[event(3)]);

        for sub in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(Ok(e)) = sub.try_recv() {
                seen.push(e.sequence);
            }
            assert_eq!(seen, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let mut subs = subscribers(8);
        let mut early = subs.attach();
        subs.broadcast(&[event(1)]);
        let mut late = subs.attach();
        subs.broadcast(&[event(2)]);

        assert_eq!(early.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(1)));
        assert_eq!(early.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(2)));
        assert_eq!(late.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(2)));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_buffer_disconnects_only_that_subscriber() {
        let mut subs = subscribers(2);
        let mut slow = subs.attach();
        let mut fast = subs.attach();

        subs.broadcast(&[event(1)]);
        assert_eq!(fast.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(1)));
        subs.broadcast(&[event(2)]);
        assert_eq!(fast.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(2)));
        subs.broadcast(&[event(3)]);

        assert_eq!(subs.len(), 1, "slow subscriber should be dropped");
        assert!(slow.is_overrun());

        // Buffered events first, then the overrun, then the end.
        assert_eq!(slow.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(1)));
        assert_eq!(slow.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(2)));
        let failure = slow
            .recv()
            .await
            .expect("overrun should be reported")
            .expect_err("overrun is a failure");
        assert_eq!(failure.kind, ErrorKind::SubscriberOverrun);
        assert!(slow.recv().await.is_none());

        assert_eq!(fast.recv().await.map(|r| r.map(|e| e.sequence)), Some(Ok(3)));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let mut subs = subscribers(4);
        let kept = subs.attach();
        drop(subs.attach());

        subs.prune_closed();
        assert_eq!(subs.len(), 1);
        drop(kept);
        subs.broadcast(&[event(1)]);
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn detach_removes_by_id() {
        let mut subs = subscribers(4);
        let mut sub = subs.attach();
        assert!(subs.detach(sub.id()));
        assert!(!subs.detach(sub.id()));
        assert!(sub.recv().await.is_none(), "detached stream should end");
    }

    #[tokio::test]
    async fn close_all_ends_streams_after_buffered_events() {
        let mut subs = subscribers(4);
        let sub = subs.attach();
        subs.broadcast(&[event(1)]);
        subs.close_all();

        let collected: Vec<_> = sub.collect().await;
        assert_eq!(collected, vec![Ok(event(1))]);
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let mut subs = subscribers(1);
        let a = subs.attach();
        let b = subs.attach();
        assert_ne!(a.id(), b.id());
    }
}
