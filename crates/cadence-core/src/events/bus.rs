//! Event bus using tokio broadcast channel
//!
//! The engine, the tiered store and the entitlement bridge share one bus
//! per [`ProgressEngine`](crate::ProgressEngine). Review submissions and
//! streak changes come from the engine, policy violations and finished
//! migrations from the store, exhausted quotas from the bridge.
//!
//! Slow subscribers miss events rather than blocking the engine.

use crate::events::ProgressEvent;
use tokio::sync::broadcast;

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Event bus for progress events
///
/// Events are fire-and-forget; with no subscribers they are dropped.
/// Cloning yields another handle onto the same channel.
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events emitted after this call.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the oldest events it missed.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Emit an event to all subscribers. Never blocks, never fails.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Subscriber to event bus
pub struct EventSubscriber {
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl EventSubscriber {
    /// Receive the next event
    ///
    /// Returns None once every bus handle is dropped. Lag is logged and
    /// skipped over.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event subscriber lagged by {} events", n);
                    continue;
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{QuotaExhaustedEvent, StreakUpdatedEvent};
    use crate::types::{Feature, Plan};

    #[tokio::test]
    async fn test_event_bus_basic() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.emit(ProgressEvent::StreakUpdated(StreakUpdatedEvent::new("u1", 3, 5)));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.user_id(), "u1");
        assert_eq!(received.event_type(), "streak.updated");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.emit(ProgressEvent::QuotaExhausted(QuotaExhaustedEvent::new(
            "u2",
            Feature::KanjiPractice,
            Plan::Free,
        )));

        let r1 = sub1.recv().await.unwrap();
        let r2 = sub2.recv().await.unwrap();
        assert_eq!(r1.user_id(), r2.user_id());
    }

    #[test]
    fn test_no_subscribers_no_panic() {
        let bus = EventBus::new();
        bus.emit(ProgressEvent::StreakUpdated(StreakUpdatedEvent::new("u1", 1, 1)));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for streak in 1..=3 {
            bus.emit(ProgressEvent::StreakUpdated(StreakUpdatedEvent::new("u1", streak, streak)));
        }

        match sub.recv().await {
            Some(ProgressEvent::StreakUpdated(e)) => assert_eq!(e.current_streak, 2),
            other => panic!("expected streak update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
