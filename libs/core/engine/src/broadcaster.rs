//! C3 — event broadcaster.
//!
//! Grounded on `tokio::sync::broadcast` (no pack example implements a
//! WebSocket fan-out to crib from): registering an observer is subscribing
//! to the channel, and a slow/dead observer naturally drops itself out by
//! receiving `RecvError::Lagged`/`RecvError::Closed` on its own receive loop,
//! which satisfies "a per-observer send failure removes that observer only"
//! without a manually-managed registry or host-side locking.

use tokio::sync::broadcast;

use crate::event::EngineEvent;

const CHANNEL_CAPACITY: usize = 1024;

/// Thread-safe, clonable handle to the broadcast channel. Every component
/// that produces observer-visible events (C2's tailer, C4 via C5/C6/C8,
/// C7, C8's expiry observer) holds a clone of this.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<EngineEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register a new observer. The returned receiver is handed to the
    /// WebSocket connection's write task; dropping it unregisters silently.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Broadcast to all currently-registered observers. A send with zero
    /// active receivers is not an error — it simply means nobody is
    /// watching right now.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[tokio::test]
    async fn publish_with_no_observers_does_not_panic() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(EngineEvent::info("no one listening"));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(EngineEvent::message_produced("s", "1-0"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::MessageProduced);
    }

    #[tokio::test]
    async fn dropping_a_receiver_does_not_affect_others() {
        let broadcaster = Broadcaster::new();
        let rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        drop(rx1);

        broadcaster.publish(EngineEvent::info("still here"));
        assert!(rx2.recv().await.is_ok());
    }
}
