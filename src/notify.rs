use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::MAX_OUTBOX_EVENTS;
use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    BookingCreated,
    BookingUpdated,
    BookingCancelled,
}

impl DomainEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventKind::BookingCreated => "BOOKING_CREATED",
            DomainEventKind::BookingUpdated => "BOOKING_UPDATED",
            DomainEventKind::BookingCancelled => "BOOKING_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub seq: u64,
    pub kind: DomainEventKind,
    pub aggregate_id: Ulid,
    pub payload: Value,
    pub at: Ms,
}

struct OutboxInner {
    next_seq: u64,
    events: VecDeque<DomainEvent>,
}

/// Per-tenant outbox of booking domain events: a bounded ring for polling
/// plus a broadcast channel for in-process subscribers.
pub struct NotifyHub {
    inner: Mutex<OutboxInner>,
    sender: broadcast::Sender<DomainEvent>,
    capacity: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_capacity(MAX_OUTBOX_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(OutboxInner {
                next_seq: 1,
                events: VecDeque::new(),
            }),
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Record an event, assigning the next sequence number.
    pub fn publish(&self, kind: DomainEventKind, aggregate_id: Ulid, payload: Value, at: Ms) -> u64 {
        let event = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let event = DomainEvent {
                seq: inner.next_seq,
                kind,
                aggregate_id,
                payload,
                at,
            };
            inner.next_seq += 1;
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
            }
            inner.events.push_back(event.clone());
            event
        };
        let seq = event.seq;
        // No subscribers is fine.
        let _ = self.sender.send(event);
        seq
    }

    /// Events with `seq > after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<DomainEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.iter().filter(|e| e.seq > after).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        let id = Ulid::new();

        let seq = hub.publish(DomainEventKind::BookingCreated, id, json!({"quantity": 3}), 10);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, seq);
        assert_eq!(received.aggregate_id, id);
        assert_eq!(received.kind.as_str(), "BOOKING_CREATED");
    }

    #[test]
    fn publish_without_subscribers_is_kept() {
        let hub = NotifyHub::new();
        hub.publish(DomainEventKind::BookingCancelled, Ulid::new(), json!({}), 0);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn ring_drops_oldest() {
        let hub = NotifyHub::with_capacity(3);
        for _ in 0..5 {
            hub.publish(DomainEventKind::BookingUpdated, Ulid::new(), json!({}), 0);
        }
        let seqs: Vec<u64> = hub.since(0).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(hub.since(4).len(), 1);
    }
}
