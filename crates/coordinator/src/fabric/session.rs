//! Per-session outbound queue with the back-pressure drop policy.
//!
//! Each live session owns one bounded queue. On overflow the oldest
//! droppable event (a `client_status` update) is evicted to admit the new
//! one; verified-IOC events are never dropped; when the queue is saturated
//! with undroppable events the session is closed and the client must
//! reconnect and re-sync.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use super::events::OutboundEvent;

/// What happened to a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event enqueued.
    Queued,
    /// Event enqueued after evicting the oldest droppable event.
    QueuedAfterDrop,
    /// The incoming event itself was droppable and was discarded.
    DroppedIncoming,
    /// Queue saturated with undroppable events; the session must close.
    Overflow,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<OutboundEvent>,
    closed: bool,
}

/// Bounded FIFO of outbound events for one session.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event, applying the drop policy on overflow.
    ///
    /// On [`PushOutcome::Overflow`] the queue is marked closed; the session
    /// loop observes this through [`OutboundQueue::pop`] returning `None`.
    pub fn push(&self, event: OutboundEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock().expect("outbound queue poisoned");
            if state.closed {
                return PushOutcome::Overflow;
            }

            if state.events.len() < self.capacity {
                state.events.push_back(event);
                PushOutcome::Queued
            } else if let Some(idx) = state.events.iter().position(|e| e.droppable()) {
                state.events.remove(idx);
                state.events.push_back(event);
                PushOutcome::QueuedAfterDrop
            } else if event.droppable() {
                PushOutcome::DroppedIncoming
            } else {
                state.closed = true;
                PushOutcome::Overflow
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Dequeue the next event, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<OutboundEvent> {
        loop {
            {
                let mut state = self.state.lock().expect("outbound queue poisoned");
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; pending events are still delivered.
    pub fn close(&self) {
        self.state.lock().expect("outbound queue poisoned").closed = true;
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("outbound queue poisoned").closed
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.state.lock().expect("outbound queue poisoned").events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threatnet_core::{IocId, IocStatus};

    fn status_event(n: usize) -> OutboundEvent {
        OutboundEvent::ClientStatus {
            client_id: format!("client-{}", n),
            online: true,
            trust: 0.5,
        }
    }

    fn ack_event() -> OutboundEvent {
        OutboundEvent::ReportAck {
            ioc_id: IocId::new("abc".into()),
            status: IocStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push(status_event(1));
        queue.push(status_event(2));

        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert!(matches!(
            first,
            OutboundEvent::ClientStatus { ref client_id, .. } if client_id == "client-1"
        ));
        assert!(matches!(
            second,
            OutboundEvent::ClientStatus { ref client_id, .. } if client_id == "client-2"
        ));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_droppable_first() {
        let queue = OutboundQueue::new(3);
        queue.push(status_event(1));
        queue.push(ack_event());
        queue.push(status_event(2));

        // Full queue: the undroppable ack evicts the oldest status event.
        assert_eq!(queue.push(ack_event()), PushOutcome::QueuedAfterDrop);
        assert_eq!(queue.len(), 3);

        let first = queue.pop().await.unwrap();
        assert!(matches!(first, OutboundEvent::ReportAck { .. }));
        let second = queue.pop().await.unwrap();
        assert!(matches!(
            second,
            OutboundEvent::ClientStatus { ref client_id, .. } if client_id == "client-2"
        ));
    }

    #[tokio::test]
    async fn test_overflow_of_undroppables_closes_queue() {
        let queue = OutboundQueue::new(2);
        assert_eq!(queue.push(ack_event()), PushOutcome::Queued);
        assert_eq!(queue.push(ack_event()), PushOutcome::Queued);

        // No droppable events to evict: a droppable incoming is discarded...
        assert_eq!(queue.push(status_event(1)), PushOutcome::DroppedIncoming);
        assert!(!queue.is_closed());

        // ...but an undroppable incoming forces the session closed.
        assert_eq!(queue.push(ack_event()), PushOutcome::Overflow);
        assert!(queue.is_closed());

        // Pending events drain, then the closed queue yields None.
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_close_is_overflow() {
        let queue = OutboundQueue::new(2);
        queue.close();
        assert_eq!(queue.push(ack_event()), PushOutcome::Overflow);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(2));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(ack_event());

        let event = popper.await.unwrap();
        assert!(matches!(event, Some(OutboundEvent::ReportAck { .. })));
    }
}
